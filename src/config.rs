// Recovery configuration
//
// One immutable value handed to the workflow at construction. Layers, lowest
// precedence first: built-in defaults, a TOML file, NANDFIX_* environment
// variables; the binary applies command-line overrides last.

use crate::{Procedure, RecoveryError, RecoveryResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "nandfix.toml";
pub const ENV_PREFIX: &str = "NANDFIX";

/// External program locations; bare names are looked up on PATH
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub archiver: PathBuf,
    pub flasher: PathBuf,
    pub generator: PathBuf,
    pub mounter: PathBuf,
    /// Only used by the loop backend
    pub unmounter: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            archiver: PathBuf::from("7z"),
            flasher: PathBuf::from("NxNandManager"),
            generator: PathBuf::from("EmmcHaccGen"),
            mounter: PathBuf::from("mount"),
            unmounter: PathBuf::from("umount"),
        }
    }
}

/// User-supplied inputs and output locations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPaths {
    pub keyset: Option<PathBuf>,
    pub firmware: Option<PathBuf>,
    /// Folder holding SYSTEM.7z, USER-32.7z and friends
    pub partitions_dir: Option<PathBuf>,
    /// Folder holding donor32.7z / donor64.7z; defaults to `partitions_dir`
    pub skeleton_dir: Option<PathBuf>,
    /// Decrypted donor PRODINFO
    pub donor_calibration: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub min_free_space_gb: u64,
    /// Interrupted USER flashes stop once this much has been written
    pub user_flash_threshold_mb: f64,
    /// Level 3 raw copy ceiling
    pub raw_copy_limit_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_free_space_gb: 60,
            user_flash_threshold_mb: 100.0,
            raw_copy_limit_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountBackend {
    /// `mount -o loop` into the work directory
    #[default]
    Loop,
    /// OSFMount drive-letter mounts
    Osfmount,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSettings {
    pub backend: MountBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub tools: ToolPaths,
    pub paths: InputPaths,
    pub limits: Limits,
    pub mount: MountSettings,
}

fn config_error(e: ::config::ConfigError) -> RecoveryError {
    RecoveryError::Configuration(e.to_string())
}

fn require<'a>(value: &'a Option<PathBuf>, what: &str) -> RecoveryResult<&'a Path> {
    value
        .as_deref()
        .ok_or_else(|| RecoveryError::Configuration(format!("{} is not set", what)))
}

fn require_existing<'a>(value: &'a Option<PathBuf>, what: &str) -> RecoveryResult<&'a Path> {
    let path = require(value, what)?;
    if path.exists() {
        Ok(path)
    } else {
        Err(RecoveryError::Configuration(format!(
            "{} not found: {}",
            what,
            path.display()
        )))
    }
}

impl RecoveryConfig {
    /// Load from defaults, then `explicit` (or the per-user config file if
    /// present), then the environment
    pub fn load(explicit: Option<&Path>) -> RecoveryResult<Self> {
        let defaults = ::config::Config::try_from(&RecoveryConfig::default()).map_err(config_error)?;
        let mut builder = ::config::Config::builder().add_source(defaults);

        match explicit {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                builder = builder.add_source(::config::File::from(path).required(true));
            }
            None => {
                if let Some(path) = Self::default_path().filter(|p| p.is_file()) {
                    tracing::debug!(path = %path.display(), "Loading configuration file");
                    builder = builder.add_source(::config::File::from(path).required(false));
                }
            }
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "nandfix", "nandfix").map(|d| d.config_dir().join(CONFIG_FILE_NAME))
    }

    pub fn scratch_base(&self) -> PathBuf {
        self.paths
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.paths.log_dir.clone().unwrap_or_else(|| {
            ProjectDirs::from("org", "nandfix", "nandfix")
                .map(|d| d.data_local_dir().join("logs"))
                .unwrap_or_else(|| std::env::temp_dir().join("nandfix-logs"))
        })
    }

    pub fn keyset(&self) -> RecoveryResult<&Path> {
        require(&self.paths.keyset, "keyset")
    }

    pub fn firmware(&self) -> RecoveryResult<&Path> {
        require(&self.paths.firmware, "firmware folder")
    }

    pub fn partitions_dir(&self) -> RecoveryResult<&Path> {
        require(&self.paths.partitions_dir, "partitions folder")
    }

    pub fn skeleton_dir(&self) -> RecoveryResult<&Path> {
        match &self.paths.skeleton_dir {
            Some(dir) => Ok(dir.as_path()),
            None => self.partitions_dir(),
        }
    }

    pub fn output_dir(&self) -> RecoveryResult<&Path> {
        require(&self.paths.output_dir, "output folder")
    }

    pub fn donor_calibration(&self) -> Option<&Path> {
        self.paths.donor_calibration.as_deref()
    }

    /// External programs a procedure invokes
    pub fn required_tools(&self, procedure: Procedure) -> Vec<(&'static str, &Path)> {
        let mut tools = vec![("archiver", self.tools.archiver.as_path())];
        tools.push(("flasher", self.tools.flasher.as_path()));
        if procedure == Procedure::UserPartitionFix {
            return tools;
        }

        tools.push(("boot file generator", self.tools.generator.as_path()));
        tools.push(("image mounter", self.tools.mounter.as_path()));
        if self.mount.backend == MountBackend::Loop {
            tools.push(("image unmounter", self.tools.unmounter.as_path()));
        }
        tools
    }

    /// Locate a tool either by explicit path or on PATH
    pub fn resolve_tool(name: &str, program: &Path) -> RecoveryResult<PathBuf> {
        if program.components().count() > 1 || program.is_absolute() {
            return if program.is_file() {
                Ok(program.to_path_buf())
            } else {
                Err(RecoveryError::DependencyUnavailable(format!(
                    "{} not found at {}",
                    name,
                    program.display()
                )))
            };
        }

        which::which(program).map_err(|e| {
            RecoveryError::DependencyUnavailable(format!("{} ({}): {}", name, program.display(), e))
        })
    }

    /// Check that every input and tool `procedure` needs is present
    pub fn validate_for(&self, procedure: Procedure) -> RecoveryResult<()> {
        require_existing(&self.paths.keyset, "keyset")?;

        match procedure {
            Procedure::UserPartitionFix => {
                require_existing(&self.paths.partitions_dir, "partitions folder")?;
            }
            Procedure::Level1 | Procedure::Level2 | Procedure::Level3 => {
                require_existing(&self.paths.firmware, "firmware folder")?;
                require(&self.paths.output_dir, "output folder")?;
                if procedure != Procedure::Level1 {
                    require_existing(&self.paths.partitions_dir, "partitions folder")?;
                }
                if procedure == Procedure::Level3 {
                    require_existing(&self.paths.donor_calibration, "donor PRODINFO")?;
                }
            }
        }

        if self.limits.user_flash_threshold_mb <= 0.0 {
            return Err(RecoveryError::Configuration(
                "limits.user_flash_threshold_mb must be positive".to_string(),
            ));
        }

        for (name, program) in self.required_tools(procedure) {
            let resolved = Self::resolve_tool(name, program)?;
            tracing::debug!(tool = name, path = %resolved.display(), "Tool available");
        }
        Ok(())
    }
}
