// Step sequences for each recovery procedure
//
// A plan is pure data. The engine walks it in order and records the index of
// the step that failed, so the sequences here are also what the user sees in
// the progress output.

use crate::merge::MergePolicy;
use crate::partitions::ArchiveTable;
use crate::{Partition, Procedure};
use std::fmt;

/// Which working image a step operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRef {
    /// Decrypted image read back from the eMMC
    Dumped(Partition),
    /// Decrypted image unpacked from a donor archive
    Extracted(Partition),
}

impl ImageRef {
    pub fn partition(&self) -> Partition {
        match self {
            ImageRef::Dumped(p) | ImageRef::Extracted(p) => *p,
        }
    }
}

/// Where the bytes for a flash come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashSource {
    /// The validated PRODINFO of this run
    Calibration,
    Image(ImageRef),
    /// A package file from the generator output
    BootPackage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashTarget {
    /// The detected eMMC
    Device,
    /// The staged donor NAND skeleton image
    Skeleton,
}

/// When a USER flash is stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truncation {
    Never,
    Always,
    /// Truncate only when PRODINFO came from the device itself
    UnlessDonorCalibration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashPlan {
    pub partition: Partition,
    pub source: FlashSource,
    pub target: FlashTarget,
    /// Re-encrypt with the keyset while writing
    pub encrypted: bool,
    pub truncation: Truncation,
}

impl FlashPlan {
    fn encrypted(partition: Partition, source: FlashSource, target: FlashTarget) -> Self {
        Self {
            partition,
            source,
            target,
            encrypted: true,
            truncation: Truncation::Never,
        }
    }

    fn boot_package(partition: Partition, target: FlashTarget) -> Self {
        Self {
            partition,
            source: FlashSource::BootPackage,
            target,
            encrypted: false,
            truncation: Truncation::Never,
        }
    }

    fn truncated(mut self, truncation: Truncation) -> Self {
        self.truncation = truncation;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CheckScratchSpace,
    DetectDevice,
    Confirm,
    /// Unpack the capacity-matched donor skeleton into the work directory
    StageSkeleton,
    DumpFromDevice {
        partition: Partition,
        /// Fall back to the donor PRODINFO if the dump fails
        donor_fallback: bool,
    },
    UseDonorCalibration,
    ValidateCalibration,
    GenerateBootMaterial,
    ExtractDonor {
        partition: Partition,
        table: ArchiveTable,
    },
    MergeContent {
        image: ImageRef,
        policy: MergePolicy,
    },
    Flash(FlashPlan),
    /// Bounded raw copy of the skeleton onto the device
    RawCopy,
    SaveArtifacts,
}

impl Step {
    /// Steps that write to the target device. Once one has started the run
    /// no longer honours interrupts.
    pub fn is_destructive(&self) -> bool {
        match self {
            Step::Flash(plan) => plan.target == FlashTarget::Device,
            Step::RawCopy => true,
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Step::CheckScratchSpace => "Checking scratch space".to_string(),
            Step::DetectDevice => "Detecting target eMMC".to_string(),
            Step::Confirm => "Waiting for confirmation".to_string(),
            Step::StageSkeleton => "Preparing donor NAND skeleton".to_string(),
            Step::DumpFromDevice { partition, .. } => {
                format!("Dumping and decrypting {} from eMMC", partition)
            }
            Step::UseDonorCalibration => "Staging donor PRODINFO".to_string(),
            Step::ValidateCalibration => "Reading PRODINFO".to_string(),
            Step::GenerateBootMaterial => "Generating boot files".to_string(),
            Step::ExtractDonor { partition, .. } => format!("Extracting donor {}", partition),
            Step::MergeContent { image, .. } => {
                format!("Injecting system content into {}", image.partition())
            }
            Step::Flash(plan) => {
                let target = match plan.target {
                    FlashTarget::Device => "eMMC",
                    FlashTarget::Skeleton => "NAND skeleton",
                };
                match plan.truncation {
                    Truncation::Never => format!("Flashing {} to {}", plan.partition, target),
                    _ => format!("Flashing {} (header) to {}", plan.partition, target),
                }
            }
            Step::RawCopy => "Writing NAND image to eMMC".to_string(),
            Step::SaveArtifacts => "Saving BOOT0 & BOOT1 to output folder".to_string(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

fn boot_packages(target: FlashTarget) -> impl Iterator<Item = Step> {
    Partition::BOOT_PACKAGES
        .into_iter()
        .map(move |p| Step::Flash(FlashPlan::boot_package(p, target)))
}

/// The ordered steps of `procedure`
pub fn plan_for(procedure: Procedure) -> Vec<Step> {
    use FlashTarget::{Device, Skeleton};

    let mut steps = vec![Step::CheckScratchSpace, Step::DetectDevice, Step::Confirm];

    match procedure {
        Procedure::Level1 => {
            steps.extend([
                Step::DumpFromDevice {
                    partition: Partition::Prodinfo,
                    donor_fallback: false,
                },
                Step::DumpFromDevice {
                    partition: Partition::System,
                    donor_fallback: false,
                },
                Step::ValidateCalibration,
                Step::GenerateBootMaterial,
                Step::MergeContent {
                    image: ImageRef::Dumped(Partition::System),
                    policy: MergePolicy::PreserveUserData,
                },
                Step::Flash(FlashPlan::encrypted(
                    Partition::System,
                    FlashSource::Image(ImageRef::Dumped(Partition::System)),
                    Device,
                )),
            ]);
            steps.extend(boot_packages(Device));
            steps.push(Step::SaveArtifacts);
        }
        Procedure::Level2 => {
            steps.extend([
                Step::DumpFromDevice {
                    partition: Partition::Prodinfo,
                    donor_fallback: true,
                },
                Step::ValidateCalibration,
                Step::GenerateBootMaterial,
                Step::ExtractDonor {
                    partition: Partition::System,
                    table: ArchiveTable::ModelKeyed,
                },
                Step::MergeContent {
                    image: ImageRef::Extracted(Partition::System),
                    policy: MergePolicy::Rebuild,
                },
                Step::Flash(FlashPlan::encrypted(
                    Partition::Prodinfo,
                    FlashSource::Calibration,
                    Device,
                )),
                Step::Flash(FlashPlan::encrypted(
                    Partition::System,
                    FlashSource::Image(ImageRef::Extracted(Partition::System)),
                    Device,
                )),
            ]);
            for partition in [Partition::ProdinfoF, Partition::User, Partition::Safe] {
                let truncation = if partition == Partition::User {
                    Truncation::UnlessDonorCalibration
                } else {
                    Truncation::Never
                };
                steps.push(Step::ExtractDonor {
                    partition,
                    table: ArchiveTable::ModelKeyed,
                });
                steps.push(Step::Flash(
                    FlashPlan::encrypted(
                        partition,
                        FlashSource::Image(ImageRef::Extracted(partition)),
                        Device,
                    )
                    .truncated(truncation),
                ));
            }
            steps.extend(boot_packages(Device));
            steps.push(Step::SaveArtifacts);
        }
        Procedure::Level3 => {
            steps.extend([
                Step::StageSkeleton,
                Step::UseDonorCalibration,
                Step::ValidateCalibration,
                Step::GenerateBootMaterial,
            ]);
            for partition in [
                Partition::System,
                Partition::ProdinfoF,
                Partition::Safe,
                Partition::User,
            ] {
                steps.push(Step::ExtractDonor {
                    partition,
                    table: ArchiveTable::CapacityKeyed,
                });
            }
            steps.push(Step::MergeContent {
                image: ImageRef::Extracted(Partition::System),
                policy: MergePolicy::ReplaceOnly,
            });
            steps.push(Step::Flash(FlashPlan::encrypted(
                Partition::Prodinfo,
                FlashSource::Calibration,
                Skeleton,
            )));
            for partition in [
                Partition::ProdinfoF,
                Partition::System,
                Partition::User,
                Partition::Safe,
            ] {
                let truncation = if partition == Partition::User {
                    Truncation::Always
                } else {
                    Truncation::Never
                };
                steps.push(Step::Flash(
                    FlashPlan::encrypted(
                        partition,
                        FlashSource::Image(ImageRef::Extracted(partition)),
                        Skeleton,
                    )
                    .truncated(truncation),
                ));
            }
            steps.extend(boot_packages(Skeleton));
            steps.push(Step::RawCopy);
            steps.push(Step::SaveArtifacts);
        }
        Procedure::UserPartitionFix => {
            steps.push(Step::ExtractDonor {
                partition: Partition::User,
                table: ArchiveTable::CapacityKeyed,
            });
            steps.push(Step::Flash(
                FlashPlan::encrypted(
                    Partition::User,
                    FlashSource::Image(ImageRef::Extracted(Partition::User)),
                    Device,
                )
                .truncated(Truncation::Always),
            ));
        }
    }

    steps
}
