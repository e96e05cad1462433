// Tests for the flash controller

use super::*;
use crate::tools::testing::{Scripted, ScriptedLauncher};
use crate::NullSink;
use std::fs;

fn controller(launcher: &ScriptedLauncher) -> FlashController {
    FlashController::new(Arc::new(launcher.clone()), "NxNandManager", "/keys/prod.keys")
}

fn user_step(threshold: Option<f64>) -> FlashStep {
    FlashStep {
        partition: Partition::User,
        source: PathBuf::from("/work/USER.dec"),
        destination: PathBuf::from("/dev/sdb"),
        decryption_required: true,
        interrupt_at_mb: threshold,
    }
}

fn restore_lines(values: &[f64]) -> Vec<String> {
    let mut lines = vec!["NxNandManager v5.2".to_string()];
    lines.extend(values.iter().map(|v| format!("Restoring to USER... {:.2} MB", v)));
    lines
}

// ==================== COMMANDS ====================

#[test]
fn test_encrypted_flash_command() {
    let launcher = ScriptedLauncher::new(|_| Scripted::default());
    let cmd = controller(&launcher).command_for(&user_step(None));
    assert_eq!(
        cmd.to_string(),
        "NxNandManager -i /work/USER.dec -o /dev/sdb -part=USER -e -keyset /keys/prod.keys FORCE"
    );
}

#[test]
fn test_plain_flash_command() {
    let launcher = ScriptedLauncher::new(|_| Scripted::default());
    let step = FlashStep {
        partition: Partition::Bcpkg2NormalMain,
        source: PathBuf::from("/gen/BCPKG2-1-Normal-Main.bin"),
        destination: PathBuf::from("/work/working_nand.img"),
        decryption_required: false,
        interrupt_at_mb: None,
    };
    let cmd = controller(&launcher).command_for(&step);
    assert_eq!(
        cmd.to_string(),
        "NxNandManager -i /gen/BCPKG2-1-Normal-Main.bin -o /work/working_nand.img \
         -part=BCPKG2-1-Normal-Main FORCE"
    );
}

#[test]
fn test_dump_command() {
    let launcher = ScriptedLauncher::new(|_| Scripted::default());
    let cmd = controller(&launcher).dump_command(
        Partition::Prodinfo,
        Path::new("/dev/sdb"),
        Path::new("/work/dump"),
    );
    assert_eq!(
        cmd.to_string(),
        "NxNandManager -i /dev/sdb -keyset /keys/prod.keys -o /work/dump -d -part=PRODINFO"
    );
}

#[test]
fn test_restore_progress_pattern() {
    let progress = RestoreProgress::new(Partition::User);
    assert_eq!(progress.megabytes("Restoring to USER... 42.50 MB"), Some(42.5));
    assert_eq!(progress.megabytes("Restoring to USER... 100.00MB (0%)"), Some(100.0));
    assert_eq!(progress.megabytes("Restoring to SYSTEM... 42.50 MB"), None);
    assert_eq!(progress.megabytes("Restoring to USER... 42 MB"), None);
}

// ==================== FULL FLASH ====================

#[test]
fn test_full_flash_success() {
    let launcher = ScriptedLauncher::new(|_| Scripted::ok(["Done"]));
    let outcome = controller(&launcher).flash(&user_step(None), &NullSink).unwrap();
    assert_eq!(outcome, FlashOutcome::Completed);
    assert_eq!(launcher.terminations(), 0);
}

#[test]
fn test_full_flash_failure() {
    let launcher = ScriptedLauncher::new(|_| Scripted::fail(1));
    let err = controller(&launcher).flash(&user_step(None), &NullSink).unwrap_err();
    assert!(matches!(err, RecoveryError::FlashFailed { ref partition, .. } if partition == "USER"));
}

// ==================== INTERRUPTED FLASH ====================

#[test]
fn test_interrupt_terminates_once_at_threshold() {
    let launcher = ScriptedLauncher::new(|_| {
        Scripted::ok(restore_lines(&[12.5, 50.0, 99.99, 100.0, 150.0, 300.0]))
    });

    let outcome = controller(&launcher)
        .flash(&user_step(Some(100.0)), &NullSink)
        .unwrap();

    assert_eq!(outcome, FlashOutcome::Interrupted { at_mb: 100.0 });
    assert_eq!(launcher.terminations(), 1);
    assert_eq!(launcher.reads_after_terminate(), 0);
}

#[test]
fn test_interrupt_first_value_above_threshold() {
    let launcher = ScriptedLauncher::new(|_| Scripted::ok(restore_lines(&[512.25])));

    let outcome = controller(&launcher)
        .flash(&user_step(Some(100.0)), &NullSink)
        .unwrap();

    assert_eq!(outcome, FlashOutcome::Interrupted { at_mb: 512.25 });
    assert_eq!(launcher.terminations(), 1);
}

#[test]
fn test_interrupt_ignores_lines_after_threshold() {
    struct Counting(std::sync::atomic::AtomicUsize);
    impl ProgressSink for Counting {
        fn line(&self, _line: &str) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        fn progress(&self, _task: &str, _percent: u8) {}
    }

    let launcher = ScriptedLauncher::new(|_| Scripted::ok(restore_lines(&[10.0, 100.0, 200.0])));
    let sink = Counting(std::sync::atomic::AtomicUsize::new(0));
    controller(&launcher)
        .flash(&user_step(Some(100.0)), &sink)
        .unwrap();

    // Banner plus the two progress lines up to and including the threshold
    assert_eq!(sink.0.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[test]
fn test_interrupt_never_reached_completes() {
    let launcher = ScriptedLauncher::new(|_| Scripted::ok(restore_lines(&[10.0, 20.0])));
    let outcome = controller(&launcher)
        .flash(&user_step(Some(100.0)), &NullSink)
        .unwrap();
    assert_eq!(outcome, FlashOutcome::Completed);
    assert_eq!(launcher.terminations(), 0);
}

#[test]
fn test_interrupt_tool_failure_before_threshold() {
    let launcher = ScriptedLauncher::new(|_| Scripted {
        lines: restore_lines(&[10.0]),
        exit_code: 3,
    });
    let err = controller(&launcher)
        .flash(&user_step(Some(100.0)), &NullSink)
        .unwrap_err();
    assert!(matches!(err, RecoveryError::FlashFailed { .. }));
}

// ==================== DUMP ====================

#[test]
fn test_dump_returns_decrypted_file() {
    let work = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(|cmd| {
        let out = PathBuf::from(&cmd.args[5]);
        fs::write(out.join("PRODINFO"), b"CAL0").unwrap();
        Scripted::ok(["Dumping PRODINFO... done"])
    });

    let dumped = controller(&launcher)
        .dump(Partition::Prodinfo, Path::new("/dev/sdb"), work.path(), &NullSink)
        .unwrap();
    assert_eq!(dumped, work.path().join("PRODINFO"));
}

#[test]
fn test_dump_without_output_fails() {
    let work = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(|_| Scripted::ok(["Bad crypto"]));

    let err = controller(&launcher)
        .dump(Partition::Prodinfo, Path::new("/dev/sdb"), work.path(), &NullSink)
        .unwrap_err();
    assert!(matches!(err, RecoveryError::DumpFailed { ref partition, .. } if partition == "PRODINFO"));
}

#[test]
fn test_dump_nonzero_exit_fails() {
    let work = tempfile::tempdir().unwrap();
    let launcher = ScriptedLauncher::new(|_| Scripted::fail(1));

    let err = controller(&launcher)
        .dump(Partition::System, Path::new("/dev/sdb"), work.path(), &NullSink)
        .unwrap_err();
    assert!(matches!(err, RecoveryError::DumpFailed { .. }));
}
