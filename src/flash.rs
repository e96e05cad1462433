// Partition flashing through the external NAND tool
//
// Full flashes run to completion. An interrupted flash watches the tool's
// "Restoring to <PART>... <n> MB" lines and stops the process the moment the
// threshold is reached; the console reinitialises the rest of the partition
// on first boot.

use crate::tools::{run_streaming, ToolCommand, ToolLauncher};
use crate::{Partition, ProgressSink, RecoveryError, RecoveryResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One invocation of the flashing tool
#[derive(Debug, Clone, PartialEq)]
pub struct FlashStep {
    pub partition: Partition,
    pub source: PathBuf,
    /// Device path or image file
    pub destination: PathBuf,
    /// Re-encrypt with the keyset while writing
    pub decryption_required: bool,
    /// Stop once this many MB have been reported
    pub interrupt_at_mb: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlashOutcome {
    Completed,
    /// Deliberately terminated once the threshold was reached
    Interrupted { at_mb: f64 },
}

/// Matches the restore progress line for one partition
pub struct RestoreProgress {
    pattern: Regex,
}

impl RestoreProgress {
    pub fn new(partition: Partition) -> Self {
        let pattern = format!(
            r"Restoring to {}\.\.\. (\d+\.\d+)\s*MB",
            regex::escape(partition.name())
        );
        Self {
            pattern: Regex::new(&pattern).expect("escaped partition name forms a valid regex"),
        }
    }

    pub fn megabytes(&self, line: &str) -> Option<f64> {
        self.pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

pub struct FlashController {
    launcher: Arc<dyn ToolLauncher>,
    flasher: PathBuf,
    keyset: PathBuf,
}

impl FlashController {
    pub fn new(
        launcher: Arc<dyn ToolLauncher>,
        flasher: impl Into<PathBuf>,
        keyset: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            flasher: flasher.into(),
            keyset: keyset.into(),
        }
    }

    pub fn command_for(&self, step: &FlashStep) -> ToolCommand {
        let mut cmd = ToolCommand::new(&self.flasher)
            .arg("-i")
            .arg(&step.source)
            .arg("-o")
            .arg(&step.destination)
            .arg(format!("-part={}", step.partition.name()));
        if step.decryption_required {
            cmd = cmd.arg("-e").arg("-keyset").arg(&self.keyset);
        }
        cmd.arg("FORCE")
    }

    pub fn dump_command(&self, partition: Partition, device: &Path, out_dir: &Path) -> ToolCommand {
        ToolCommand::new(&self.flasher)
            .arg("-i")
            .arg(device)
            .arg("-keyset")
            .arg(&self.keyset)
            .arg("-o")
            .arg(out_dir)
            .arg("-d")
            .arg(format!("-part={}", partition.name()))
    }

    /// Flash one partition
    pub fn flash(&self, step: &FlashStep, sink: &dyn ProgressSink) -> RecoveryResult<FlashOutcome> {
        let cmd = self.command_for(step);
        tracing::info!(
            partition = %step.partition,
            destination = %step.destination.display(),
            encrypted = step.decryption_required,
            "Flashing partition"
        );

        match step.interrupt_at_mb {
            None => {
                let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| sink.line(line))?;
                if !exit.success() {
                    return Err(RecoveryError::FlashFailed {
                        partition: step.partition.name().to_string(),
                        reason: exit.to_string(),
                    });
                }
                Ok(FlashOutcome::Completed)
            }
            Some(threshold) => self.flash_interrupted(step, &cmd, threshold, sink),
        }
    }

    fn flash_interrupted(
        &self,
        step: &FlashStep,
        cmd: &ToolCommand,
        threshold: f64,
        sink: &dyn ProgressSink,
    ) -> RecoveryResult<FlashOutcome> {
        tracing::info!(
            partition = %step.partition,
            target_mb = threshold,
            "Starting partial flash"
        );

        let progress = RestoreProgress::new(step.partition);
        let mut process = self.launcher.launch(cmd)?;

        while let Some(line) = process.next_line() {
            sink.line(&line);
            let Some(mb) = progress.megabytes(&line) else {
                continue;
            };
            if mb >= threshold {
                tracing::info!(partition = %step.partition, at_mb = mb, "Reached target, terminating flash");
                process.terminate()?;
                let exit = process.wait()?;
                tracing::debug!(%exit, "Flash tool stopped");
                return Ok(FlashOutcome::Interrupted { at_mb: mb });
            }
        }

        let exit = process.wait()?;
        if !exit.success() {
            return Err(RecoveryError::FlashFailed {
                partition: step.partition.name().to_string(),
                reason: format!("{} before reaching {} MB", exit, threshold),
            });
        }
        tracing::warn!(
            partition = %step.partition,
            target_mb = threshold,
            "Flash finished before the interrupt threshold was reported"
        );
        Ok(FlashOutcome::Completed)
    }

    /// Dump and decrypt one partition from `device` into `out_dir`
    pub fn dump(
        &self,
        partition: Partition,
        device: &Path,
        out_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> RecoveryResult<PathBuf> {
        let failed = |reason: String| RecoveryError::DumpFailed {
            partition: partition.name().to_string(),
            reason,
        };

        std::fs::create_dir_all(out_dir)?;
        let cmd = self.dump_command(partition, device, out_dir);
        tracing::info!(partition = %partition, device = %device.display(), "Dumping and decrypting");

        let exit = run_streaming(self.launcher.as_ref(), &cmd, |line| sink.line(line))
            .map_err(|e| failed(e.to_string()))?;
        if !exit.success() {
            return Err(failed(exit.to_string()));
        }

        let dumped = out_dir.join(partition.name());
        if !dumped.is_file() {
            return Err(failed(format!("{} was not produced", dumped.display())));
        }
        Ok(dumped)
    }
}

#[cfg(test)]
mod flash_tests;
