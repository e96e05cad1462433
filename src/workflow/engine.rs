// Recovery engine - walks a procedure's plan against real or scripted collaborators
//
// Every run owns a fresh work directory that is removed on every exit path.
// The first failing step ends the run; nothing after it executes.

use super::plan::{plan_for, FlashSource, FlashTarget, ImageRef, Step, Truncation};
use crate::calibration::{CalibrationHeader, CalibrationReader, HardwareRevision};
use crate::config::{MountBackend, RecoveryConfig};
use crate::device::{select_single, Device, DeviceCatalog, DeviceEnumerator, SysfsEnumerator};
use crate::flash::{FlashController, FlashOutcome, FlashStep};
use crate::io::RawDeviceWriter;
use crate::merge::ContentMerger;
use crate::partitions::PartitionSource;
use crate::tools::{
    BootMaterial, BootMaterialGenerator, ImageMounter, LoopMounter, MountGuard, OsfMounter,
    SystemLauncher, ToolLauncher,
};
use crate::workdir::{check_free_space, WorkDirectory};
use crate::{
    is_interrupted, CalibrationOrigin, Partition, Procedure, ProgressSink, RecoveryError,
    RecoveryResult,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Asks the operator to approve a destructive procedure against `device`
pub trait Confirmer: Send + Sync {
    fn confirm(&self, procedure: Procedure, device: &Device) -> bool;
}

/// The outside world a workflow talks to
pub struct Collaborators {
    pub devices: Box<dyn DeviceEnumerator>,
    pub launcher: Arc<dyn ToolLauncher>,
    pub mounter: Box<dyn ImageMounter>,
    pub confirmer: Box<dyn Confirmer>,
}

impl Collaborators {
    /// Real sysfs enumeration, real subprocesses and the configured mount backend
    pub fn system(config: &RecoveryConfig, confirmer: Box<dyn Confirmer>) -> Self {
        let launcher: Arc<dyn ToolLauncher> = Arc::new(SystemLauncher);
        let mounter: Box<dyn ImageMounter> = match config.mount.backend {
            MountBackend::Loop => Box::new(LoopMounter::new(
                launcher.clone(),
                &config.tools.mounter,
                &config.tools.unmounter,
            )),
            MountBackend::Osfmount => {
                Box::new(OsfMounter::new(launcher.clone(), &config.tools.mounter))
            }
        };

        Self {
            devices: Box::new(SysfsEnumerator::new()),
            launcher,
            mounter,
            confirmer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The operator declined at the confirmation point; nothing was written
    Cancelled,
}

/// Summary of one finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub procedure: Procedure,
    pub run_id: Uuid,
    pub device: Option<Device>,
    pub revision: Option<HardwareRevision>,
    pub donor_calibration_used: bool,
    pub steps_completed: usize,
    pub elapsed: Duration,
    pub outcome: RunOutcome,
}

/// A run that stopped on an error
#[derive(Error, Debug)]
#[error("{procedure} failed at {}: {error}", .step.as_deref().unwrap_or("preflight"))]
pub struct RecoveryFailure {
    pub procedure: Procedure,
    /// Description of the failing step; `None` before the plan started
    pub step: Option<String>,
    /// 1-based index into the plan
    pub step_index: Option<usize>,
    /// Whether anything had been written to the device
    pub destructive_started: bool,
    #[source]
    pub error: RecoveryError,
}

impl RecoveryFailure {
    pub fn preflight(procedure: Procedure, error: RecoveryError) -> Self {
        Self {
            procedure,
            step: None,
            step_index: None,
            destructive_started: false,
            error,
        }
    }

    pub fn remediation(&self) -> String {
        self.error.remediation(self.procedure)
    }
}

/// Mutable state threaded through the steps of one run
#[derive(Default)]
struct RunState {
    device: Option<Device>,
    calibration: Option<(PathBuf, CalibrationOrigin)>,
    header: Option<CalibrationHeader>,
    boot: Option<BootMaterial>,
    skeleton: Option<PathBuf>,
    dumped: HashMap<Partition, PathBuf>,
    extracted: HashMap<Partition, PathBuf>,
    destructive_started: bool,
}

impl RunState {
    fn device(&self) -> RecoveryResult<&Device> {
        self.device
            .as_ref()
            .ok_or(RecoveryError::MissingPrerequisite("the target device"))
    }

    fn calibration(&self) -> RecoveryResult<(&Path, CalibrationOrigin)> {
        self.calibration
            .as_ref()
            .map(|(path, origin)| (path.as_path(), *origin))
            .ok_or(RecoveryError::MissingPrerequisite("PRODINFO"))
    }

    fn header(&self) -> RecoveryResult<&CalibrationHeader> {
        self.header
            .as_ref()
            .ok_or(RecoveryError::MissingPrerequisite("the hardware revision"))
    }

    fn boot(&self) -> RecoveryResult<&BootMaterial> {
        self.boot
            .as_ref()
            .ok_or(RecoveryError::MissingPrerequisite("boot material"))
    }

    fn skeleton(&self) -> RecoveryResult<&Path> {
        self.skeleton
            .as_deref()
            .ok_or(RecoveryError::MissingPrerequisite("the NAND skeleton"))
    }

    fn image(&self, image: ImageRef) -> RecoveryResult<&Path> {
        let found = match image {
            ImageRef::Dumped(p) => self.dumped.get(&p),
            ImageRef::Extracted(p) => self.extracted.get(&p),
        };
        found
            .map(PathBuf::as_path)
            .ok_or(RecoveryError::MissingPrerequisite("a partition image"))
    }

    fn donor_calibration_used(&self) -> bool {
        matches!(self.calibration, Some((_, CalibrationOrigin::DonorFile)))
    }
}

enum StepOutcome {
    Continue,
    Cancelled,
}

/// Runs recovery procedures. One instance may run any number of procedures,
/// one at a time.
pub struct RecoveryWorkflow {
    config: RecoveryConfig,
    catalog: DeviceCatalog,
    launcher: Arc<dyn ToolLauncher>,
    mounter: Box<dyn ImageMounter>,
    confirmer: Box<dyn Confirmer>,
    sink: Arc<dyn ProgressSink>,
}

impl RecoveryWorkflow {
    pub fn new(
        config: RecoveryConfig,
        collaborators: Collaborators,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            config,
            catalog: DeviceCatalog::new(collaborators.devices),
            launcher: collaborators.launcher,
            mounter: collaborators.mounter,
            confirmer: collaborators.confirmer,
            sink,
        }
    }

    /// Candidate devices as the detection step would see them
    pub fn list_candidate_devices(&self) -> RecoveryResult<Vec<Device>> {
        self.catalog.list_candidate_devices()
    }

    /// Execute `procedure` from start to finish
    pub fn run(&self, procedure: Procedure) -> Result<RunReport, RecoveryFailure> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("recovery", %run_id, procedure = procedure.slug());
        let _enter = span.enter();
        let started = Instant::now();

        tracing::info!("Starting {}", procedure);
        self.config
            .validate_for(procedure)
            .map_err(|e| RecoveryFailure::preflight(procedure, e))?;

        let workdir = WorkDirectory::create(&self.config.scratch_base(), procedure)
            .map_err(|e| RecoveryFailure::preflight(procedure, e))?;

        let steps = plan_for(procedure);
        let mut state = RunState::default();
        let result = self.execute(procedure, &steps, &workdir, &mut state);
        workdir.cleanup();

        let (steps_completed, outcome) = match result {
            Ok(done) => done,
            Err(failure) => {
                tracing::error!(
                    step = failure.step_index,
                    error = %failure.error,
                    "{} failed",
                    procedure
                );
                return Err(failure);
            }
        };

        let report = RunReport {
            procedure,
            run_id,
            device: state.device.take(),
            revision: state.header.map(|h| h.revision),
            donor_calibration_used: state.donor_calibration_used(),
            steps_completed,
            elapsed: started.elapsed(),
            outcome,
        };
        tracing::info!(
            outcome = ?report.outcome,
            elapsed = %humantime::format_duration(Duration::from_secs(report.elapsed.as_secs())),
            "{} finished",
            procedure
        );
        Ok(report)
    }

    fn execute(
        &self,
        procedure: Procedure,
        steps: &[Step],
        workdir: &WorkDirectory,
        state: &mut RunState,
    ) -> Result<(usize, RunOutcome), RecoveryFailure> {
        let total = steps.len();
        let mut interrupt_reported = false;

        for (i, step) in steps.iter().enumerate() {
            let index = i + 1;
            let description = step.describe();
            let fail = |error: RecoveryError, destructive_started: bool| RecoveryFailure {
                procedure,
                step: Some(description.clone()),
                step_index: Some(index),
                destructive_started,
                error,
            };

            if is_interrupted() {
                if !state.destructive_started {
                    return Err(fail(RecoveryError::Interrupted, false));
                }
                if !interrupt_reported {
                    interrupt_reported = true;
                    tracing::warn!("Interrupt ignored: the device is being written and the run cannot be cancelled");
                    self.sink
                        .line("--- Interrupt received while the eMMC is being written; finishing the run.");
                }
            }
            if step.is_destructive() {
                state.destructive_started = true;
            }

            tracing::info!(step = index, total, "{}", description);
            self.sink.step_started(index, total, &description);
            let step_started = Instant::now();

            match self.execute_step(procedure, step, workdir, state) {
                Ok(StepOutcome::Continue) => {
                    self.sink
                        .step_finished(index, &description, step_started.elapsed());
                }
                Ok(StepOutcome::Cancelled) => {
                    tracing::info!("User cancelled {}", procedure);
                    self.sink.line("--- User cancelled the operation.");
                    return Ok((i, RunOutcome::Cancelled));
                }
                Err(e) => return Err(fail(e, state.destructive_started)),
            }
        }

        Ok((total, RunOutcome::Completed))
    }

    fn execute_step(
        &self,
        procedure: Procedure,
        step: &Step,
        workdir: &WorkDirectory,
        state: &mut RunState,
    ) -> RecoveryResult<StepOutcome> {
        let sink = self.sink.as_ref();

        match *step {
            Step::CheckScratchSpace => {
                check_free_space(
                    &self.config.scratch_base(),
                    self.config.limits.min_free_space_gb,
                )?;
            }

            Step::DetectDevice => {
                let device = select_single(self.catalog.list_candidate_devices()?)?;
                sink.line(&format!("Found target eMMC: {}", device));
                state.device = Some(device);
            }

            Step::Confirm => {
                let device = state.device()?;
                if !self.confirmer.confirm(procedure, device) {
                    return Ok(StepOutcome::Cancelled);
                }
                tracing::info!(device = %device.path, "User confirmed target eMMC");
            }

            Step::StageSkeleton => {
                let band = state.device()?.band;
                let working = self.partition_source()?.stage_skeleton(band, workdir.path(), sink)?;
                state.skeleton = Some(working);
            }

            Step::DumpFromDevice {
                partition,
                donor_fallback,
            } => {
                let device = PathBuf::from(&state.device()?.path);
                let dump_dir = workdir.join("dump");
                match self.flasher()?.dump(partition, &device, &dump_dir, sink) {
                    Ok(path) if partition == Partition::Prodinfo => {
                        sink.line("--- SUCCESS: PRODINFO dumped from eMMC.");
                        state.calibration = Some((path, CalibrationOrigin::Device));
                    }
                    Ok(path) => {
                        state.dumped.insert(partition, path);
                    }
                    Err(e) if donor_fallback && partition == Partition::Prodinfo => {
                        tracing::warn!(error = %e, "Could not dump PRODINFO, falling back to donor file");
                        sink.line("--- INFO: Could not dump from eMMC. Falling back to donor PRODINFO file.");
                        let staged = self
                            .source_for_calibration()
                            .stage_calibration(self.config.donor_calibration(), &dump_dir)?;
                        state.calibration = Some((staged, CalibrationOrigin::DonorFile));
                    }
                    Err(e) => return Err(e),
                }
            }

            Step::UseDonorCalibration => {
                let staged = self
                    .source_for_calibration()
                    .stage_calibration(self.config.donor_calibration(), &workdir.join("calibration"))?;
                state.calibration = Some((staged, CalibrationOrigin::DonorFile));
            }

            Step::ValidateCalibration => {
                let (path, origin) = state.calibration()?;
                let header = CalibrationReader::read_header(path, origin)?;
                sink.line(&format!("SUCCESS: Detected model: {}", header.revision));
                state.header = Some(header);
            }

            Step::GenerateBootMaterial => {
                let revision = state.header()?.revision;
                let generator = BootMaterialGenerator::new(
                    self.launcher.clone(),
                    &self.config.tools.generator,
                    self.config.keyset()?,
                    self.config.firmware()?,
                );
                let material = generator.generate(revision, &workdir.join("generator_out"), sink)?;
                state.boot = Some(material);
            }

            Step::ExtractDonor { partition, table } => {
                let band = state.device()?.band;
                let revision = state.header.map(|h| h.revision);
                let image = self.partition_source()?.extract_partition(
                    table,
                    partition,
                    band,
                    revision,
                    &workdir.join("donor"),
                    sink,
                )?;
                state.extracted.insert(partition, image);
            }

            Step::MergeContent { image, policy } => {
                let target = state.image(image)?;
                let source = state.boot()?.system_tree();

                let guard = MountGuard::mount(self.mounter.as_ref(), target, workdir.path())?;
                sink.line(&format!("--- SUCCESS: {} mounted to {}", image.partition(), guard.root().display()));
                let summary = ContentMerger::new(policy).merge(&source, guard.root())?;
                guard.release()?;

                tracing::debug!(touched = summary.touched(), "Merged into {}", image.partition());
                sink.line(&format!(
                    "--- Injected system content: {} replaced, {} added, {} preserved",
                    summary.replaced.len(),
                    summary.added.len(),
                    summary.preserved.len()
                ));
            }

            Step::Flash(plan) => {
                let source = match plan.source {
                    FlashSource::Calibration => state.calibration()?.0.to_path_buf(),
                    FlashSource::Image(image) => state.image(image)?.to_path_buf(),
                    FlashSource::BootPackage => state.boot()?.package(plan.partition)?,
                };
                let destination = match plan.target {
                    FlashTarget::Device => PathBuf::from(&state.device()?.path),
                    FlashTarget::Skeleton => state.skeleton()?.to_path_buf(),
                };
                let threshold = self.config.limits.user_flash_threshold_mb;
                let interrupt_at_mb = match plan.truncation {
                    Truncation::Never => None,
                    Truncation::Always => Some(threshold),
                    Truncation::UnlessDonorCalibration if state.donor_calibration_used() => None,
                    Truncation::UnlessDonorCalibration => Some(threshold),
                };

                let flash = FlashStep {
                    partition: plan.partition,
                    source,
                    destination,
                    decryption_required: plan.encrypted,
                    interrupt_at_mb,
                };
                match self.flasher()?.flash(&flash, sink)? {
                    FlashOutcome::Completed => {
                        sink.line(&format!("--- SUCCESS: {} flashed.", plan.partition));
                    }
                    FlashOutcome::Interrupted { at_mb } => sink.line(&format!(
                        "--- SUCCESS: First {:.0} MB of {} written; the console initialises the rest.",
                        at_mb, plan.partition
                    )),
                }
            }

            Step::RawCopy => {
                let device = state.device()?;
                sink.line("--- This may take a few minutes. Do not disconnect the Switch.");
                let report = RawDeviceWriter::write_bounded(
                    state.skeleton()?,
                    Path::new(&device.path),
                    self.config.limits.raw_copy_limit_bytes,
                    sink,
                )?;
                sink.line(&format!(
                    "--- SUCCESS: Copied {:.2} GB to target eMMC",
                    report.bytes_written as f64 / (1024.0 * 1024.0 * 1024.0)
                ));
            }

            Step::SaveArtifacts => {
                let output = self.config.output_dir()?;
                let saved = state.boot()?.export_boot_regions(output)?;
                sink.line(&format!(
                    "SUCCESS: BOOT0 and BOOT1 saved to {}. Please flash them manually using Hekate.",
                    output.display()
                ));
                tracing::info!(files = saved.len(), "Boot regions exported");
            }
        }

        Ok(StepOutcome::Continue)
    }

    fn flasher(&self) -> RecoveryResult<FlashController> {
        Ok(FlashController::new(
            self.launcher.clone(),
            &self.config.tools.flasher,
            self.config.keyset()?,
        ))
    }

    fn partition_source(&self) -> RecoveryResult<PartitionSource> {
        Ok(PartitionSource::new(
            self.launcher.clone(),
            &self.config.tools.archiver,
            self.config.partitions_dir()?,
            self.config.skeleton_dir()?,
        ))
    }

    /// Calibration staging never touches the archives, so it does not need
    /// the partitions folder to be configured
    fn source_for_calibration(&self) -> PartitionSource {
        let dir = self.config.paths.partitions_dir.clone().unwrap_or_default();
        PartitionSource::new(
            self.launcher.clone(),
            &self.config.tools.archiver,
            dir.clone(),
            dir,
        )
    }
}
