use crate::{RecoveryError, RecoveryResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Accepted capacity windows, in GiB (inclusive)
const SMALL_BAND_GB: (f64, f64) = (28.0, 31.0);
const LARGE_BAND_GB: (f64, f64) = (57.0, 61.0);

/// Sysfs reports sizes in 512-byte sectors regardless of the logical block size
const SYSFS_SECTOR_SIZE: u64 = 512;

/// Capacity signature of a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapacityBand {
    /// 32 GB eMMC
    Small,
    /// 64 GB eMMC
    Large,
    Rejected,
}

impl CapacityBand {
    pub fn classify(size_bytes: u64) -> Self {
        let gb = size_bytes as f64 / GIB as f64;

        if (SMALL_BAND_GB.0..=SMALL_BAND_GB.1).contains(&gb) {
            CapacityBand::Small
        } else if (LARGE_BAND_GB.0..=LARGE_BAND_GB.1).contains(&gb) {
            CapacityBand::Large
        } else {
            CapacityBand::Rejected
        }
    }

    pub fn is_accepted(&self) -> bool {
        !matches!(self, CapacityBand::Rejected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CapacityBand::Small => "32GB",
            CapacityBand::Large => "64GB",
            CapacityBand::Rejected => "unsupported",
        }
    }
}

/// A physical disk as reported by the enumeration service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDisk {
    pub path: String,
    pub size_bytes: u64,
    pub model: String,
}

/// A candidate target device. Rebuilt on every detection pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub path: String,
    pub size_bytes: u64,
    pub band: CapacityBand,
    pub model: String,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / GIB as f64
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.2} GB, {})",
            self.path,
            self.size_gb(),
            self.model
        )
    }
}

/// Source of physical disks visible to the host
#[cfg_attr(test, mockall::automock)]
pub trait DeviceEnumerator: Send + Sync {
    /// Enumerate every physical disk. An error means the enumeration
    /// subsystem itself is unavailable, not that nothing was found.
    fn physical_disks(&self) -> RecoveryResult<Vec<PhysicalDisk>>;
}

/// Enumerates block devices through `/sys/block`
pub struct SysfsEnumerator {
    sys_block: PathBuf,
    dev_root: PathBuf,
}

impl SysfsEnumerator {
    pub fn new() -> Self {
        Self::with_roots("/sys/block", "/dev")
    }

    pub fn with_roots(sys_block: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_root: dev_root.into(),
        }
    }

    /// Check if device should be skipped
    pub(crate) fn should_skip_device(device_name: &str) -> bool {
        // Skip loop devices, ram disks, device mapper, etc.
        device_name.starts_with("loop")
            || device_name.starts_with("ram")
            || device_name.starts_with("dm-")
            || device_name.starts_with("sr")
            || device_name.starts_with("zram")
            || device_name.starts_with("md")
    }

    fn read_trimmed(path: &Path) -> Option<String> {
        fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn read_disk(&self, dir: &Path, name: &str) -> Option<PhysicalDisk> {
        let sectors: u64 = Self::read_trimmed(&dir.join("size"))?.parse().ok()?;

        let vendor = Self::read_trimmed(&dir.join("device").join("vendor"));
        let model = Self::read_trimmed(&dir.join("device").join("model"));
        let model = match (vendor, model) {
            (Some(v), Some(m)) => format!("{} {}", v, m),
            (None, Some(m)) => m,
            (Some(v), None) => v,
            (None, None) => "Unknown".to_string(),
        };

        Some(PhysicalDisk {
            path: self.dev_root.join(name).to_string_lossy().into_owned(),
            size_bytes: sectors * SYSFS_SECTOR_SIZE,
            model,
        })
    }
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEnumerator for SysfsEnumerator {
    fn physical_disks(&self) -> RecoveryResult<Vec<PhysicalDisk>> {
        let entries = fs::read_dir(&self.sys_block).map_err(|e| {
            RecoveryError::DependencyUnavailable(format!(
                "block device enumeration ({}): {}",
                self.sys_block.display(),
                e
            ))
        })?;

        let mut disks = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if Self::should_skip_device(&name) {
                continue;
            }

            match self.read_disk(&entry.path(), &name) {
                Some(disk) => disks.push(disk),
                None => tracing::debug!(device = %name, "Skipping device without a readable size"),
            }
        }

        disks.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(disks)
    }
}

/// Filters physical disks down to plausible Switch eMMC targets
pub struct DeviceCatalog {
    enumerator: Box<dyn DeviceEnumerator>,
}

impl DeviceCatalog {
    pub fn new(enumerator: Box<dyn DeviceEnumerator>) -> Self {
        Self { enumerator }
    }

    /// Every attached device whose capacity falls in an accepted band.
    /// An empty result is not an error.
    pub fn list_candidate_devices(&self) -> RecoveryResult<Vec<Device>> {
        tracing::info!("Detecting all physical drives");

        let candidates: Vec<Device> = self
            .enumerator
            .physical_disks()?
            .into_iter()
            .filter_map(|disk| {
                let band = CapacityBand::classify(disk.size_bytes);
                band.is_accepted().then(|| Device {
                    path: disk.path,
                    size_bytes: disk.size_bytes,
                    band,
                    model: disk.model,
                })
            })
            .collect();

        for device in &candidates {
            tracing::info!(device = %device.path, size_gb = device.size_gb(), "Found potential Switch drive");
        }
        if candidates.is_empty() {
            tracing::info!("No drives matching Switch eMMC size were found");
        }

        Ok(candidates)
    }
}

/// Enforce the single-target policy: the workflow never guesses
pub fn select_single(mut candidates: Vec<Device>) -> RecoveryResult<Device> {
    match candidates.len() {
        0 => Err(RecoveryError::DeviceNotFound),
        1 => Ok(candidates.remove(0)),
        count => Err(RecoveryError::DeviceAmbiguous { count }),
    }
}
