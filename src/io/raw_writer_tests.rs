// Tests for the bounded raw writer

use super::raw_writer::*;
use crate::{ProgressSink, RawWriteFailure, RecoveryError};
use proptest::prelude::*;
use std::fs;
use std::io::{self, Cursor};
use std::sync::Mutex;

#[derive(Default)]
struct PercentLog(Mutex<Vec<u8>>);

impl ProgressSink for PercentLog {
    fn line(&self, _line: &str) {}
    fn progress(&self, _task: &str, percent: u8) {
        self.0.lock().unwrap().push(percent);
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ==================== CLASSIFICATION ====================

#[test]
fn test_classify_errors() {
    let denied = io::Error::from(io::ErrorKind::PermissionDenied);
    assert_eq!(classify(&denied), RawWriteFailure::PermissionDenied);

    let einval = io::Error::from_raw_os_error(libc::EINVAL);
    assert_eq!(classify(&einval), RawWriteFailure::DeviceLocked);

    let ebusy = io::Error::from_raw_os_error(libc::EBUSY);
    assert_eq!(classify(&ebusy), RawWriteFailure::DeviceLocked);

    let eio = io::Error::from_raw_os_error(libc::EIO);
    assert_eq!(classify(&eio), RawWriteFailure::OtherIO);
}

#[test]
fn test_percent_of() {
    assert_eq!(percent_of(0, 100), 0);
    assert_eq!(percent_of(50, 100), 50);
    assert_eq!(percent_of(200, 100), 100);
    assert_eq!(percent_of(0, 0), 100);
    assert_eq!(percent_of(u64::MAX, u64::MAX), 100);
}

// ==================== BOUNDED COPY ====================

#[test]
fn test_writes_exactly_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("working_nand.img");
    let target = dir.path().join("device");
    fs::write(&source, pattern(3 * CHUNK_SIZE + 123)).unwrap();
    fs::write(&target, b"").unwrap();

    let log = PercentLog::default();
    let limit = 2 * CHUNK_SIZE as u64 + 10;
    let report = RawDeviceWriter::write_bounded(&source, &target, limit, &log).unwrap();

    assert_eq!(report.bytes_written, limit);
    assert!(!report.source_exhausted);
    let written = fs::read(&target).unwrap();
    assert_eq!(written.len() as u64, limit);
    assert_eq!(written[..], pattern(3 * CHUNK_SIZE + 123)[..limit as usize]);
    assert_eq!(log.0.lock().unwrap().last(), Some(&100));
}

#[test]
fn test_short_source_is_a_warning_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("working_nand.img");
    let target = dir.path().join("device");
    fs::write(&source, pattern(CHUNK_SIZE + 5)).unwrap();
    fs::write(&target, b"").unwrap();

    let report =
        RawDeviceWriter::write_bounded(&source, &target, 4 * CHUNK_SIZE as u64, &crate::NullSink)
            .unwrap();

    assert_eq!(report.bytes_written, CHUNK_SIZE as u64 + 5);
    assert!(report.source_exhausted);
    assert_eq!(fs::read(&target).unwrap().len(), CHUNK_SIZE + 5);
}

#[test]
fn test_missing_target_is_raw_write_failure() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("working_nand.img");
    fs::write(&source, pattern(16)).unwrap();

    let err = RawDeviceWriter::write_bounded(
        &source,
        &dir.path().join("no-such-device"),
        16,
        &crate::NullSink,
    )
    .unwrap_err();

    assert!(matches!(
        err,
        RecoveryError::RawWriteFailed {
            kind: RawWriteFailure::OtherIO,
            ..
        }
    ));
}

#[test]
fn test_zero_limit_writes_nothing() {
    let mut out = Vec::new();
    let (written, exhausted) =
        copy_bounded(&mut Cursor::new(pattern(10)), &mut out, 0, |_| {}).unwrap();
    assert_eq!(written, 0);
    assert!(!exhausted);
    assert!(out.is_empty());
}

#[test]
fn test_write_error_propagates() {
    struct Failing;
    impl io::Write for Failing {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from_raw_os_error(libc::EIO))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let err = copy_bounded(&mut Cursor::new(pattern(10)), &mut Failing, 10, |_| {}).unwrap_err();
    assert_eq!(classify(&err), RawWriteFailure::OtherIO);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_writes_min_of_source_and_bound(
        size in 0usize..(3 * CHUNK_SIZE + 7),
        bound in 0u64..(4 * CHUNK_SIZE as u64),
    ) {
        let data = pattern(size);
        let mut out = Vec::new();
        let mut percents = Vec::new();

        let (written, _) = copy_bounded(&mut Cursor::new(&data), &mut out, bound, |w| {
            percents.push(percent_of(w, bound));
        }).unwrap();

        let expected = (size as u64).min(bound);
        prop_assert_eq!(written, expected);
        prop_assert_eq!(out.len() as u64, expected);
        prop_assert_eq!(&out[..], &data[..expected as usize]);
        prop_assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(percents.iter().all(|p| *p <= 100));
    }
}
