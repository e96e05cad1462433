// Donor partition archives
//
// Resolves which archive provides a partition for a given device and drives
// the external archiver to unpack it into the run's work directory.

use crate::calibration::HardwareRevision;
use crate::device::CapacityBand;
use crate::io::raw_writer::CHUNK_SIZE;
use crate::tools::{run_streaming, ToolCommand, ToolExit, ToolLauncher};
use crate::{Partition, ProgressSink, RecoveryError, RecoveryResult};
use lazy_static::lazy_static;
use regex::Regex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

lazy_static! {
    static ref PERCENT: Regex = Regex::new(r"(\d+)\s*%").expect("valid regex");
}

/// Extension the archives use for decrypted partition images
const DECRYPTED_EXT: &str = "dec";

/// Which rule picks the USER archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveTable {
    /// USER variant follows the device capacity band
    CapacityKeyed,
    /// USER variant follows the console model (OLED ships 64GB)
    ModelKeyed,
}

/// A whole-device donor image used as the Level 3 skeleton
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkeletonSpec {
    pub archive: &'static str,
    pub image: &'static str,
}

impl SkeletonSpec {
    pub fn for_band(band: CapacityBand) -> RecoveryResult<Self> {
        match band {
            CapacityBand::Small => Ok(Self {
                archive: "donor32.7z",
                image: "rawnand32.bin",
            }),
            CapacityBand::Large => Ok(Self {
                archive: "donor64.7z",
                image: "rawnand64.bin",
            }),
            CapacityBand::Rejected => Err(RecoveryError::ExtractionFailed {
                partition: "NAND skeleton".to_string(),
                reason: "no donor skeleton for an unsupported capacity".to_string(),
            }),
        }
    }
}

/// Map a partition to its donor archive file name
pub fn resolve_archive(
    table: ArchiveTable,
    partition: Partition,
    band: CapacityBand,
    revision: Option<HardwareRevision>,
) -> RecoveryResult<String> {
    let name = match partition {
        Partition::System => "SYSTEM.7z",
        Partition::ProdinfoF => "PRODINFOF.7z",
        Partition::Safe => "SAFE.7z",
        Partition::User => {
            let large = match (table, revision) {
                (ArchiveTable::ModelKeyed, Some(revision)) => revision == HardwareRevision::Oled,
                _ => match band {
                    CapacityBand::Large => true,
                    CapacityBand::Small => false,
                    CapacityBand::Rejected => {
                        return Err(RecoveryError::ExtractionFailed {
                            partition: partition.name().to_string(),
                            reason: "no donor archive for an unsupported capacity".to_string(),
                        })
                    }
                },
            };
            if large {
                "USER-64.7z"
            } else {
                "USER-32.7z"
            }
        }
        _ => {
            return Err(RecoveryError::ExtractionFailed {
                partition: partition.name().to_string(),
                reason: "partition has no donor archive".to_string(),
            })
        }
    };
    Ok(name.to_string())
}

/// Recognise an archiver progress line such as ` 42% 3 - SYSTEM.dec`
pub fn parse_percent(line: &str) -> Option<u8> {
    PERCENT
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|p| p.min(100) as u8)
}

/// Donor archives and the archiver that unpacks them
pub struct PartitionSource {
    launcher: Arc<dyn ToolLauncher>,
    archiver: PathBuf,
    partitions_dir: PathBuf,
    skeleton_dir: PathBuf,
}

impl PartitionSource {
    pub fn new(
        launcher: Arc<dyn ToolLauncher>,
        archiver: impl Into<PathBuf>,
        partitions_dir: impl Into<PathBuf>,
        skeleton_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            archiver: archiver.into(),
            partitions_dir: partitions_dir.into(),
            skeleton_dir: skeleton_dir.into(),
        }
    }

    pub fn extract_command(&self, archive: &Path, dest: &Path) -> ToolCommand {
        let mut out = std::ffi::OsString::from("-o");
        out.push(dest);
        ToolCommand::new(&self.archiver)
            .arg("x")
            .arg(archive)
            .arg(out)
            .args(["-bsp1", "-y"])
    }

    /// Run the archiver, forwarding progress percentages and output lines
    pub fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        task: &str,
        sink: &dyn ProgressSink,
    ) -> RecoveryResult<ToolExit> {
        fs::create_dir_all(dest)?;
        let cmd = self.extract_command(archive, dest);

        let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| match parse_percent(line) {
            Some(percent) => sink.progress(task, percent),
            None => sink.line(line),
        })?;
        sink.finish(task);
        Ok(exit)
    }

    /// Extract the donor image for `partition` into `dest`, returning the
    /// path of the unpacked `<NAME>.dec`
    pub fn extract_partition(
        &self,
        table: ArchiveTable,
        partition: Partition,
        band: CapacityBand,
        revision: Option<HardwareRevision>,
        dest: &Path,
        sink: &dyn ProgressSink,
    ) -> RecoveryResult<PathBuf> {
        let failed = |reason: String| RecoveryError::ExtractionFailed {
            partition: partition.name().to_string(),
            reason,
        };

        let archive_name = resolve_archive(table, partition, band, revision)?;
        let archive = self.partitions_dir.join(&archive_name);
        if !archive.is_file() {
            return Err(failed(format!("{} not found", archive.display())));
        }

        tracing::info!(partition = %partition, archive = %archive_name, "Extracting donor partition");
        let task = format!("Extracting {}", partition);
        let exit = self
            .extract(&archive, dest, &task, sink)
            .map_err(|e| failed(e.to_string()))?;
        if !exit.success() {
            return Err(failed(format!("archiver returned {}", exit)));
        }

        let image = dest.join(format!("{}.{}", partition.name(), DECRYPTED_EXT));
        if !image.is_file() {
            return Err(failed(format!("{} missing after extraction", image.display())));
        }
        Ok(image)
    }

    /// Unpack the capacity-matched donor skeleton and copy it to
    /// `working_nand.img` inside `workdir`
    pub fn stage_skeleton(
        &self,
        band: CapacityBand,
        workdir: &Path,
        sink: &dyn ProgressSink,
    ) -> RecoveryResult<PathBuf> {
        let spec = SkeletonSpec::for_band(band)?;
        let failed = |reason: String| RecoveryError::ExtractionFailed {
            partition: "NAND skeleton".to_string(),
            reason,
        };

        let archive = self.skeleton_dir.join(spec.archive);
        if !archive.is_file() {
            return Err(failed(format!("{} not found", archive.display())));
        }

        tracing::info!(band = band.label(), archive = spec.archive, "Preparing donor NAND skeleton");
        let extract_dir = workdir.join("donor_extract");
        let task = format!("Extracting {} donor NAND", band.label());
        let exit = self
            .extract(&archive, &extract_dir, &task, sink)
            .map_err(|e| failed(e.to_string()))?;
        if !exit.success() {
            return Err(failed(format!("archiver returned {}", exit)));
        }

        let extracted = extract_dir.join(spec.image);
        if !extracted.is_file() {
            return Err(failed(format!("{} missing after extraction", extracted.display())));
        }

        let working = workdir.join("working_nand.img");
        copy_with_progress(&extracted, &working, "Copying NAND skeleton", sink)?;
        if let Err(e) = fs::remove_file(&extracted) {
            tracing::debug!(error = %e, "Could not remove extracted skeleton");
        }
        Ok(working)
    }

    /// Place a user-supplied calibration file at `dest_dir/PRODINFO`
    pub fn stage_calibration(&self, donor: Option<&Path>, dest_dir: &Path) -> RecoveryResult<PathBuf> {
        let donor = donor
            .filter(|p| p.is_file())
            .ok_or(RecoveryError::CalibrationUnavailable)?;

        fs::create_dir_all(dest_dir)?;
        let staged = dest_dir.join(Partition::Prodinfo.name());
        fs::copy(donor, &staged)?;
        tracing::info!(donor = %donor.display(), "Using donor PRODINFO");
        Ok(staged)
    }
}

/// Chunked file copy reporting percentage progress
pub fn copy_with_progress(
    source: &Path,
    dest: &Path,
    task: &str,
    sink: &dyn ProgressSink,
) -> RecoveryResult<u64> {
    let total = fs::metadata(source)?.len();
    let mut src = File::open(source)?;
    let mut dst = File::create(dest)?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut copied: u64 = 0;
    loop {
        let n = src.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buffer[..n])?;
        copied += n as u64;

        let percent = if total == 0 { 100 } else { (copied * 100 / total).min(100) };
        sink.progress(task, percent as u8);
    }
    dst.flush()?;
    sink.finish(task);

    tracing::info!(task, bytes = copied, "Copy finished");
    Ok(copied)
}
