// Per-run scratch directory

use crate::{Procedure, RecoveryError, RecoveryResult};
use nix::sys::statvfs::statvfs;
use std::path::{Path, PathBuf};
use tempfile::{Builder, TempDir};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Private scratch space owned by one workflow run. Removed when dropped,
/// on success and failure alike.
#[derive(Debug)]
pub struct WorkDirectory {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl WorkDirectory {
    /// Create `nandfix_<procedure>_<timestamp>_XXXX` under `base`
    pub fn create(base: &Path, procedure: Procedure) -> RecoveryResult<Self> {
        std::fs::create_dir_all(base)?;
        let prefix = format!(
            "nandfix_{}_{}_",
            procedure.slug(),
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let dir = Builder::new().prefix(&prefix).tempdir_in(base)?;
        let path = dir.path().to_path_buf();

        tracing::info!(path = %path.display(), "Created work directory");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory now; failures are logged, not escalated
    pub fn cleanup(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if let Some(dir) = self.dir.take() {
            match dir.close() {
                Ok(()) => tracing::info!(path = %self.path.display(), "Cleaned up work directory"),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove work directory"
                ),
            }
        }
    }
}

impl Drop for WorkDirectory {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Free space available to unprivileged users on the volume holding `path`, in GB
pub fn available_space_gb(path: &Path) -> RecoveryResult<f64> {
    let stats = statvfs(path).map_err(|e| RecoveryError::Io(std::io::Error::from(e)))?;
    let bytes = stats.blocks_available() as u64 * stats.fragment_size() as u64;
    Ok(bytes as f64 / BYTES_PER_GB)
}

/// Gate a run on free scratch space. A failure of the check itself is
/// logged and the run proceeds.
pub fn check_free_space(path: &Path, required_gb: u64) -> RecoveryResult<()> {
    match available_space_gb(path) {
        Ok(available_gb) if available_gb < required_gb as f64 => {
            Err(RecoveryError::InsufficientScratchSpace {
                path: path.to_path_buf(),
                required_gb,
                available_gb,
            })
        }
        Ok(available_gb) => {
            tracing::info!(path = %path.display(), available_gb, "Disk space check passed");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not check disk space, continuing");
            Ok(())
        }
    }
}
