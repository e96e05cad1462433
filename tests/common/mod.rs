//! Common fixtures for end-to-end workflow tests
//!
//! - fake_tools: simulated external programs, disks and a recording sink
//! - Harness: a temporary tree with every input a run needs
#![allow(dead_code)]

pub mod fake_tools;

use fake_tools::{calibration_bytes, Behaviour, FakeTools, RecordingSink, StaticDisks};
use nandfix::config::{InputPaths, RecoveryConfig, ToolPaths};
use nandfix::device::{Device, PhysicalDisk};
use nandfix::workflow::Confirmer;
use nandfix::{Collaborators, Procedure, RecoveryWorkflow};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SMALL_EMMC: u64 = 31_268_536_320;
pub const LARGE_EMMC: u64 = 62_537_072_640;

/// Bytes the Level 3 raw copy may write in tests
pub const RAW_LIMIT: u64 = 1024 * 1024 + 512;

pub const DONOR_ARCHIVES: [&str; 7] = [
    "SYSTEM.7z",
    "PRODINFOF.7z",
    "SAFE.7z",
    "USER-32.7z",
    "USER-64.7z",
    "donor32.7z",
    "donor64.7z",
];

pub fn disk(path: &str, size_bytes: u64) -> PhysicalDisk {
    PhysicalDisk {
        path: path.to_string(),
        size_bytes,
        model: "hekate SD RAW".to_string(),
    }
}

pub struct Answer(pub bool);

impl Confirmer for Answer {
    fn confirm(&self, _procedure: Procedure, _device: &Device) -> bool {
        self.0
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: RecoveryConfig,
    pub tools: FakeTools,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(behaviour: Behaviour) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["bin", "firmware", "partitions", "output", "scratch"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }

        let tool = |name: &str| {
            let path = root.join("bin").join(name);
            fs::write(&path, b"").unwrap();
            path
        };
        for archive in DONOR_ARCHIVES {
            fs::write(root.join("partitions").join(archive), b"7z").unwrap();
        }
        fs::write(root.join("prod.keys"), b"master_key_00 = 00").unwrap();
        fs::write(root.join("emmc"), b"").unwrap();

        let mut config = RecoveryConfig {
            tools: ToolPaths {
                archiver: tool("7z"),
                flasher: tool("NxNandManager"),
                generator: tool("EmmcHaccGen"),
                mounter: tool("mount"),
                unmounter: tool("umount"),
            },
            paths: InputPaths {
                keyset: Some(root.join("prod.keys")),
                firmware: Some(root.join("firmware")),
                partitions_dir: Some(root.join("partitions")),
                output_dir: Some(root.join("output")),
                scratch_dir: Some(root.join("scratch")),
                ..Default::default()
            },
            ..Default::default()
        };
        config.limits.min_free_space_gb = 0;
        config.limits.raw_copy_limit_bytes = RAW_LIMIT;

        Self {
            dir,
            config,
            tools: FakeTools::new(behaviour),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    /// Provide a decrypted donor PRODINFO for `model_code`
    pub fn with_donor_calibration(mut self, model_code: u32) -> Self {
        let path = self.dir.path().join("donor_prodinfo.bin");
        fs::write(&path, calibration_bytes(model_code)).unwrap();
        self.config.paths.donor_calibration = Some(path);
        self
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Regular file standing in for the target eMMC
    pub fn emmc(&self) -> String {
        self.path("emmc").to_string_lossy().into_owned()
    }

    pub fn emmc_disk(&self, size_bytes: u64) -> PhysicalDisk {
        disk(&self.emmc(), size_bytes)
    }

    pub fn workflow(&self, disks: Vec<PhysicalDisk>, confirm: bool) -> RecoveryWorkflow {
        RecoveryWorkflow::new(
            self.config.clone(),
            Collaborators {
                devices: Box::new(StaticDisks(disks)),
                launcher: Arc::new(self.tools.clone()),
                mounter: Box::new(nandfix::tools::LoopMounter::new(
                    Arc::new(self.tools.clone()),
                    &self.config.tools.mounter,
                    &self.config.tools.unmounter,
                )),
                confirmer: Box::new(Answer(confirm)),
            },
            self.sink.clone(),
        )
    }

    pub fn scratch_is_empty(&self) -> bool {
        is_empty(&self.path("scratch"))
    }
}

pub fn is_empty(dir: &Path) -> bool {
    fs::read_dir(dir).unwrap().next().is_none()
}
