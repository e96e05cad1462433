use super::process::{run_streaming, ToolCommand, ToolLauncher};
use crate::{RecoveryError, RecoveryResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

lazy_static! {
    static ref DRIVE_LETTER: Regex = Regex::new(r"([A-Z]:)").expect("valid regex");
}

/// A mounted filesystem image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Identifier the backend needs to release the mount
    pub id: String,
    /// Filesystem root of the mounted image
    pub root: PathBuf,
}

pub trait ImageMounter: Send + Sync {
    /// Mount `image` read-write. `scratch` is a directory the backend may use
    /// for its mount point.
    fn mount(&self, image: &Path, scratch: &Path) -> RecoveryResult<MountPoint>;

    fn unmount(&self, mount: &MountPoint) -> RecoveryResult<()>;
}

fn mount_failed(image: &Path, reason: impl Into<String>) -> RecoveryError {
    RecoveryError::MountFailed {
        image: image.to_path_buf(),
        reason: reason.into(),
    }
}

/// Linux loop-device backend: `mount -o loop,rw` / `umount`
pub struct LoopMounter {
    launcher: Arc<dyn ToolLauncher>,
    mount_program: PathBuf,
    unmount_program: PathBuf,
}

impl LoopMounter {
    pub fn new(
        launcher: Arc<dyn ToolLauncher>,
        mount_program: impl Into<PathBuf>,
        unmount_program: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            mount_program: mount_program.into(),
            unmount_program: unmount_program.into(),
        }
    }
}

impl ImageMounter for LoopMounter {
    fn mount(&self, image: &Path, scratch: &Path) -> RecoveryResult<MountPoint> {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let target = scratch.join(format!("mnt_{}", stem));
        fs::create_dir_all(&target).map_err(|e| mount_failed(image, e.to_string()))?;

        let cmd = ToolCommand::new(&self.mount_program)
            .args(["-o", "loop,rw"])
            .arg(image)
            .arg(&target);

        let mut output = Vec::new();
        let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| {
            tracing::debug!(line, "mount");
            output.push(line.to_string());
        })
        .map_err(|e| mount_failed(image, e.to_string()))?;

        if !exit.success() {
            let _ = fs::remove_dir(&target);
            return Err(mount_failed(image, format!("{}: {}", exit, output.join(" "))));
        }

        tracing::info!(image = %image.display(), mount_point = %target.display(), "Image mounted");
        Ok(MountPoint {
            id: target.to_string_lossy().into_owned(),
            root: target,
        })
    }

    fn unmount(&self, mount: &MountPoint) -> RecoveryResult<()> {
        let cmd = ToolCommand::new(&self.unmount_program).arg(&mount.root);
        let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| {
            tracing::debug!(line, "umount");
        })?;

        if !exit.success() {
            return Err(mount_failed(&mount.root, format!("unmount: {}", exit)));
        }

        let _ = fs::remove_dir(&mount.root);
        tracing::info!(mount_point = %mount.id, "Image unmounted");
        Ok(())
    }
}

/// OSFMount backend: the service assigns a drive letter
pub struct OsfMounter {
    launcher: Arc<dyn ToolLauncher>,
    program: PathBuf,
}

impl OsfMounter {
    pub fn new(launcher: Arc<dyn ToolLauncher>, program: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            program: program.into(),
        }
    }

    pub(crate) fn parse_drive_letter(output: &str) -> Option<String> {
        DRIVE_LETTER
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl ImageMounter for OsfMounter {
    fn mount(&self, image: &Path, _scratch: &Path) -> RecoveryResult<MountPoint> {
        let cmd = ToolCommand::new(&self.program)
            .args(["-a", "-t", "file", "-f"])
            .arg(image)
            .args(["-o", "rw", "-m", "#:"]);

        let mut output = String::new();
        let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| {
            tracing::debug!(line, "osfmount");
            output.push_str(line);
            output.push('\n');
        })
        .map_err(|e| mount_failed(image, e.to_string()))?;

        if !exit.success() {
            return Err(mount_failed(image, exit.to_string()));
        }

        let letter = Self::parse_drive_letter(&output)
            .ok_or_else(|| mount_failed(image, "could not determine the mounted drive letter"))?;

        tracing::info!(image = %image.display(), drive = %letter, "Image mounted");
        Ok(MountPoint {
            root: PathBuf::from(format!("{}\\", letter)),
            id: letter,
        })
    }

    fn unmount(&self, mount: &MountPoint) -> RecoveryResult<()> {
        let cmd = ToolCommand::new(&self.program).args(["-D", "-m", mount.id.as_str()]);
        let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| {
            tracing::debug!(line, "osfmount");
        })?;

        if !exit.success() {
            return Err(mount_failed(&mount.root, format!("dismount: {}", exit)));
        }
        tracing::info!(drive = %mount.id, "Image unmounted");
        Ok(())
    }
}

/// Holds a mount and releases it when dropped
pub struct MountGuard<'a> {
    mounter: &'a dyn ImageMounter,
    point: Option<MountPoint>,
}

impl<'a> MountGuard<'a> {
    pub fn mount(mounter: &'a dyn ImageMounter, image: &Path, scratch: &Path) -> RecoveryResult<Self> {
        let point = mounter.mount(image, scratch)?;
        Ok(Self {
            mounter,
            point: Some(point),
        })
    }

    pub fn root(&self) -> &Path {
        self.point
            .as_ref()
            .map(|p| p.root.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Unmount now and report the result
    pub fn release(mut self) -> RecoveryResult<()> {
        match self.point.take() {
            Some(point) => self.mounter.unmount(&point),
            None => Ok(()),
        }
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Some(point) = self.point.take() {
            if let Err(e) = self.mounter.unmount(&point) {
                tracing::warn!(mount_point = %point.id, error = %e, "Failed to unmount image");
            }
        }
    }
}
