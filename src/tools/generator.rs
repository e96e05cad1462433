use super::process::{run_streaming, ToolCommand, ToolLauncher};
use crate::calibration::HardwareRevision;
use crate::{Partition, ProgressSink, RecoveryError, RecoveryResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Boot-region files and the names they are saved under
const BOOT_REGIONS: [(&str, &str); 2] = [("BOOT0.bin", "BOOT0"), ("BOOT1.bin", "BOOT1")];

const SYSTEM_TREE: &str = "SYSTEM";

/// Drives the external boot-material generator
pub struct BootMaterialGenerator {
    launcher: Arc<dyn ToolLauncher>,
    program: PathBuf,
    keyset: PathBuf,
    firmware: PathBuf,
}

impl BootMaterialGenerator {
    pub fn new(
        launcher: Arc<dyn ToolLauncher>,
        program: impl Into<PathBuf>,
        keyset: impl Into<PathBuf>,
        firmware: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            program: program.into(),
            keyset: keyset.into(),
            firmware: firmware.into(),
        }
    }

    pub fn command_for(&self, revision: HardwareRevision, out_dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.program)
            .arg("--keys")
            .arg(&self.keyset)
            .arg("--fw")
            .arg(&self.firmware)
            .arg(revision.family().generator_flag())
            .current_dir(out_dir)
    }

    /// Generate boot material for `revision` into `out_dir`
    pub fn generate(
        &self,
        revision: HardwareRevision,
        out_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> RecoveryResult<BootMaterial> {
        fs::create_dir_all(out_dir)?;

        let cmd = self.command_for(revision, out_dir);
        tracing::info!(
            model = %revision,
            flag = revision.family().generator_flag(),
            "Generating boot files"
        );

        let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| sink.line(line))?;
        if !exit.success() {
            return Err(RecoveryError::GeneratorFailed(format!(
                "{} returned {}",
                cmd.program_name(),
                exit
            )));
        }

        let material = BootMaterial::locate(out_dir)?;
        material.verify()?;
        Ok(material)
    }
}

/// The versioned output folder of one generator run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMaterial {
    root: PathBuf,
}

impl BootMaterial {
    /// Find the versioned folder the generator created inside `out_dir`
    pub fn locate(out_dir: &Path) -> RecoveryResult<Self> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(out_dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();

        let root = dirs.into_iter().next().ok_or_else(|| {
            RecoveryError::GeneratorFailed("no generator output folder found".to_string())
        })?;

        tracing::debug!(folder = %root.display(), "Located generator output");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn system_tree(&self) -> PathBuf {
        self.root.join(SYSTEM_TREE)
    }

    pub fn package(&self, partition: Partition) -> RecoveryResult<PathBuf> {
        let path = self.root.join(format!("{}.bin", partition.name()));
        if path.is_file() {
            Ok(path)
        } else {
            Err(RecoveryError::GeneratorFailed(format!(
                "{}.bin not found in generator output",
                partition.name()
            )))
        }
    }

    fn verify(&self) -> RecoveryResult<()> {
        if !self.system_tree().is_dir() {
            return Err(RecoveryError::GeneratorFailed(
                "generator output has no SYSTEM folder".to_string(),
            ));
        }
        for package in Partition::BOOT_PACKAGES {
            self.package(package)?;
        }
        for (file, _) in BOOT_REGIONS {
            if !self.root.join(file).is_file() {
                return Err(RecoveryError::GeneratorFailed(format!(
                    "{} not found in generator output",
                    file
                )));
            }
        }
        Ok(())
    }

    /// Copy BOOT0/BOOT1 to `output_dir` under their fixed names
    pub fn export_boot_regions(&self, output_dir: &Path) -> RecoveryResult<Vec<PathBuf>> {
        fs::create_dir_all(output_dir).map_err(|source| RecoveryError::ExportFailed {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let mut saved = Vec::with_capacity(BOOT_REGIONS.len());
        for (file, name) in BOOT_REGIONS {
            let target = output_dir.join(name);
            fs::copy(self.root.join(file), &target).map_err(|source| {
                RecoveryError::ExportFailed {
                    path: target.clone(),
                    source,
                }
            })?;
            saved.push(target);
        }

        tracing::info!(output = %output_dir.display(), "BOOT0 and BOOT1 saved");
        Ok(saved)
    }
}
