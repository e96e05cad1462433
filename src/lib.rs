// Allow uppercase acronyms for on-device partition names like PRODINFO, BCPKG2
#![allow(clippy::upper_case_acronyms)]

pub mod calibration;
pub mod config;
pub mod crash;
pub mod device;
pub mod flash;
pub mod io;
pub mod merge;
pub mod partitions;
pub mod tools;
pub mod ui;
pub mod workdir;
pub mod workflow;

// Re-export the workflow entry points for convenience
pub use config::RecoveryConfig;
pub use workflow::{Collaborators, RecoveryFailure, RecoveryWorkflow, RunOutcome, RunReport};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

// Global flag for handling Ctrl+C interrupts
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Set the interrupt flag (called by signal handler)
pub fn set_interrupted() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Check if an interrupt has been received
pub fn is_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Reset the interrupt flag (primarily for testing)
pub fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Where a piece of calibration data came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationOrigin {
    /// Dumped and decrypted from the target eMMC
    Device,
    /// Supplied by the user as a decrypted donor file
    DonorFile,
}

impl fmt::Display for CalibrationOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationOrigin::Device => write!(f, "eMMC"),
            CalibrationOrigin::DonorFile => write!(f, "donor file"),
        }
    }
}

/// Why a raw device write failed; each maps to its own remediation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawWriteFailure {
    PermissionDenied,
    /// Device is mounted, held open, or blocked by another program
    DeviceLocked,
    OtherIO,
}

impl fmt::Display for RawWriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawWriteFailure::PermissionDenied => write!(f, "permission denied"),
            RawWriteFailure::DeviceLocked => write!(f, "device locked or in use"),
            RawWriteFailure::OtherIO => write!(f, "I/O error"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("No device matching the Switch eMMC size signature was found")]
    DeviceNotFound,

    #[error("{count} devices match the Switch eMMC size signature")]
    DeviceAmbiguous { count: usize },

    #[error(
        "Insufficient scratch space on {}: need {required_gb} GB, have {available_gb:.1} GB",
        .path.display()
    )]
    InsufficientScratchSpace {
        path: PathBuf,
        required_gb: u64,
        available_gb: f64,
    },

    #[error("PRODINFO from the {origin} is invalid or still encrypted (magic is not CAL0)")]
    InvalidCalibrationMagic { origin: CalibrationOrigin },

    #[error("PRODINFO from the {origin} is truncated ({len} bytes)")]
    CalibrationTruncated { origin: CalibrationOrigin, len: u64 },

    #[error("PRODINFO could not be dumped from the eMMC and no donor file was provided")]
    CalibrationUnavailable,

    #[error("Failed to dump {partition} from the eMMC: {reason}")]
    DumpFailed { partition: String, reason: String },

    #[error("Failed to extract donor {partition}: {reason}")]
    ExtractionFailed { partition: String, reason: String },

    #[error("Failed to mount {}: {reason}", .image.display())]
    MountFailed { image: PathBuf, reason: String },

    #[error("Content merge failed at {}: {source}", .path.display())]
    MergeFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to flash {partition}: {reason}")]
    FlashFailed { partition: String, reason: String },

    #[error("Raw write to {device} failed ({kind}): {source}")]
    RawWriteFailed {
        device: String,
        kind: RawWriteFailure,
        #[source]
        source: std::io::Error,
    },

    #[error("Boot file generation failed: {0}")]
    GeneratorFailed(String),

    #[error("Failed to save {}: {source}", .path.display())]
    ExportFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Required dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Workflow step ran before {0} was available")]
    MissingPrerequisite(&'static str),

    #[error("Another recovery run is already in progress")]
    RunInProgress,

    #[error("Operation interrupted by user")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecoveryError {
    /// User-facing remediation for this failure in the context of `procedure`
    pub fn remediation(&self, procedure: Procedure) -> String {
        match self {
            RecoveryError::DeviceNotFound => "Connect the Switch in Hekate's eMMC RAW GPP mode \
                 (Read-Only OFF) and make sure the connection is stable."
                .to_string(),
            RecoveryError::DeviceAmbiguous { .. } => "Found multiple drives that could be a \
                 Switch eMMC. For safety, disconnect other 32GB or 64GB USB drives and try again."
                .to_string(),
            RecoveryError::InsufficientScratchSpace { .. } => "Free up space or select a \
                 different scratch directory in the configuration."
                .to_string(),
            RecoveryError::InvalidCalibrationMagic { origin, .. }
            | RecoveryError::CalibrationTruncated { origin, .. } => match (procedure, origin) {
                (Procedure::Level1, _) => {
                    "PRODINFO is not found or damaged. Please use Level 2 or Level 3 instead."
                        .to_string()
                }
                (Procedure::Level2, CalibrationOrigin::Device) => {
                    "PRODINFO on the eMMC is damaged and Level 2 cannot replace it. \
                     Use Level 3 with a decrypted donor PRODINFO instead."
                        .to_string()
                }
                _ => "The donor PRODINFO is not correct, make sure it is decrypted!".to_string(),
            },
            RecoveryError::CalibrationUnavailable => match procedure {
                Procedure::Level3 => {
                    "Select a decrypted donor PRODINFO file before starting Level 3.".to_string()
                }
                _ => "PRODINFO is not found or damaged. Please use Level 3 instead.".to_string(),
            },
            RecoveryError::DumpFailed { partition, .. } if partition == "PRODINFO" => {
                "PRODINFO is not found or damaged. Please use Level 2 or Level 3 instead."
                    .to_string()
            }
            RecoveryError::DumpFailed { .. } => "The eMMC could not be read. Check the \
                 connection and the keyset, or use a higher recovery level."
                .to_string(),
            RecoveryError::ExtractionFailed { .. } => "Check that the partitions folder \
                 contains intact donor archives and that 7-Zip is installed."
                .to_string(),
            RecoveryError::MountFailed { .. } => "Check that the image mounter is installed \
                 and that the tool has administrator privileges."
                .to_string(),
            RecoveryError::MergeFailed { .. } => "The SYSTEM image was left partially updated. \
                 Re-run the whole procedure from the beginning."
                .to_string(),
            RecoveryError::FlashFailed { .. } => "Check the connection to the Switch and the \
                 keyset, then re-run the procedure from the beginning."
                .to_string(),
            RecoveryError::RawWriteFailed { kind, .. } => match kind {
                RawWriteFailure::PermissionDenied => "Permission denied when writing to the \
                     drive. Run the tool with administrator/root privileges."
                    .to_string(),
                RawWriteFailure::DeviceLocked => "Cannot access the physical drive. Ensure no \
                     other programs are using the drive, temporarily disable antivirus, \
                     or disconnect and reconnect the Switch."
                    .to_string(),
                RawWriteFailure::OtherIO => "A write error occurred on the eMMC. Check the \
                     connection and re-run Level 3."
                    .to_string(),
            },
            RecoveryError::GeneratorFailed(_) => "Check that the keyset and firmware folder \
                 are valid for the boot file generator."
                .to_string(),
            RecoveryError::ExportFailed { .. } => "Check that the output folder exists and is \
                 writable, then copy BOOT0 and BOOT1 manually."
                .to_string(),
            RecoveryError::DependencyUnavailable(_) => "Install the missing tool or point the \
                 configuration at its location."
                .to_string(),
            RecoveryError::Configuration(_) => "Fix the configuration and try again.".to_string(),
            RecoveryError::RunInProgress => "Wait for the running procedure to finish.".to_string(),
            RecoveryError::Interrupted => "Nothing was written; the procedure can be restarted."
                .to_string(),
            RecoveryError::MissingPrerequisite(_) | RecoveryError::Io(_) => {
                "Re-run the procedure from the beginning.".to_string()
            }
        }
    }
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;

/// The recovery procedures the engine knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Procedure {
    /// In-place restore that preserves user data
    Level1,
    /// Full rebuild from donor partitions, erases user data
    Level2,
    /// Complete reconstruction into a donor skeleton, then a raw write
    Level3,
    /// Replace only the USER partition
    UserPartitionFix,
}

impl Procedure {
    /// Short identifier used for work directory names
    pub fn slug(&self) -> &'static str {
        match self {
            Procedure::Level1 => "level1",
            Procedure::Level2 => "level2",
            Procedure::Level3 => "level3",
            Procedure::UserPartitionFix => "user_fix",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Procedure::Level1 => "Level 1 System Restore",
            Procedure::Level2 => "Level 2 Full Rebuild",
            Procedure::Level3 => "Level 3 Complete Recovery",
            Procedure::UserPartitionFix => "USER Partition Fix",
        }
    }

    /// Warning shown at the confirmation point
    pub fn confirmation_warning(&self) -> &'static str {
        match self {
            Procedure::Level1 => "This will start the Level 1 System Restore process.\n\
                 User data like saves and games will be preserved.",
            Procedure::Level2 => "WARNING: This will start the Level 2 Full Rebuild process.\n\
                 ALL USER DATA (saves, games) WILL BE PERMANENTLY ERASED.",
            Procedure::Level3 => "WARNING: ALL DATA ON THIS DRIVE WILL BE PERMANENTLY ERASED.\n\
                 This will perform a complete Level 3 recovery.",
            Procedure::UserPartitionFix => "This procedure will alter and fix the USER partition \
                 only.\nAll user data on this partition will be erased.",
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title())
    }
}

/// eMMC partitions the engine reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Calibration data
    Prodinfo,
    /// Calibration companion filesystem
    ProdinfoF,
    System,
    User,
    Safe,
    Bcpkg2NormalMain,
    Bcpkg2NormalSub,
    Bcpkg2SafeModeMain,
    Bcpkg2SafeModeSub,
}

impl Partition {
    /// The four boot-companion packages produced by the boot file generator
    pub const BOOT_PACKAGES: [Partition; 4] = [
        Partition::Bcpkg2NormalMain,
        Partition::Bcpkg2NormalSub,
        Partition::Bcpkg2SafeModeMain,
        Partition::Bcpkg2SafeModeSub,
    ];

    /// Partition tag understood by the flashing tool
    pub fn name(&self) -> &'static str {
        match self {
            Partition::Prodinfo => "PRODINFO",
            Partition::ProdinfoF => "PRODINFOF",
            Partition::System => "SYSTEM",
            Partition::User => "USER",
            Partition::Safe => "SAFE",
            Partition::Bcpkg2NormalMain => "BCPKG2-1-Normal-Main",
            Partition::Bcpkg2NormalSub => "BCPKG2-2-Normal-Sub",
            Partition::Bcpkg2SafeModeMain => "BCPKG2-3-SafeMode-Main",
            Partition::Bcpkg2SafeModeSub => "BCPKG2-4-SafeMode-Sub",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Receives the live output of a recovery run.
///
/// External tool output is forwarded line by line through [`ProgressSink::line`];
/// recognised percentages are reported through [`ProgressSink::progress`] instead.
pub trait ProgressSink: Send + Sync {
    /// A verbatim output line from an external tool or the engine
    fn line(&self, line: &str);

    /// Normalised progress (0-100) for a named task
    fn progress(&self, task: &str, percent: u8);

    /// The named task has finished reporting progress
    fn finish(&self, _task: &str) {}

    fn step_started(&self, _index: usize, _total: usize, _description: &str) {}

    fn step_finished(&self, _index: usize, _description: &str, _elapsed: std::time::Duration) {}
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn line(&self, _line: &str) {}
    fn progress(&self, _task: &str, _percent: u8) {}
}
