use crate::{ProgressSink, RawWriteFailure, RecoveryError, RecoveryResult};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Instant;

/// Transfer unit for raw copies
pub const CHUNK_SIZE: usize = 1024 * 1024;

const PROGRESS_TASK: &str = "Writing to eMMC";

/// Result of a bounded raw write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawWriteReport {
    pub bytes_written: u64,
    pub limit: u64,
    /// The source ended before the limit was reached
    pub source_exhausted: bool,
}

/// Classify an I/O error against the target device
pub fn classify(error: &io::Error) -> RawWriteFailure {
    if error.kind() == ErrorKind::PermissionDenied {
        return RawWriteFailure::PermissionDenied;
    }
    match error.raw_os_error() {
        // EINVAL: locked volume; EBUSY: mounted or held open exclusively elsewhere
        Some(code) if code == libc::EINVAL || code == libc::EBUSY => RawWriteFailure::DeviceLocked,
        _ => RawWriteFailure::OtherIO,
    }
}

pub struct RawDeviceWriter;

impl RawDeviceWriter {
    /// Copy at most `max_bytes` of `source` onto `target` in 1 MiB chunks,
    /// then commit to physical media before closing the device
    pub fn write_bounded(
        source: &Path,
        target: &Path,
        max_bytes: u64,
        sink: &dyn ProgressSink,
    ) -> RecoveryResult<RawWriteReport> {
        let device = target.display().to_string();
        let failed = |source: io::Error| RecoveryError::RawWriteFailed {
            device: device.clone(),
            kind: classify(&source),
            source,
        };

        let mut input = File::open(source)?;
        let mut output = Self::open_exclusive(target).map_err(failed)?;

        tracing::info!(
            source = %source.display(),
            device = %device,
            limit_mb = max_bytes / (1024 * 1024),
            "Starting raw write"
        );
        let start = Instant::now();

        let transfer = copy_bounded(&mut input, &mut output, max_bytes, |written| {
            sink.progress(PROGRESS_TASK, percent_of(written, max_bytes));
        });

        // Flush to media on every path; the handle closes when `output` drops
        let synced = output.sync_all();
        drop(output);
        sink.finish(PROGRESS_TASK);

        let (bytes_written, source_exhausted) = transfer.map_err(failed)?;
        synced.map_err(failed)?;

        if source_exhausted {
            tracing::warn!(
                bytes_written,
                limit = max_bytes,
                "Source image ended before the write limit; it may be smaller than expected"
            );
        }

        let elapsed = start.elapsed();
        tracing::info!(
            bytes_written,
            elapsed = %humantime::format_duration(std::time::Duration::from_secs(elapsed.as_secs())),
            "Raw write complete"
        );

        Ok(RawWriteReport {
            bytes_written,
            limit: max_bytes,
            source_exhausted,
        })
    }

    fn open_exclusive(target: &Path) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        opts.write(true);

        // On Linux O_EXCL without O_CREAT fails with EBUSY for block devices in use
        #[cfg(unix)]
        opts.custom_flags(libc::O_EXCL);

        opts.open(target)
    }
}

/// Percentage of `limit` covered by `written`, capped at 100
pub fn percent_of(written: u64, limit: u64) -> u8 {
    if limit == 0 {
        return 100;
    }
    ((written as u128 * 100 / limit as u128).min(100)) as u8
}

/// Fill `buf` from `reader` unless the source ends first
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Chunked copy of at most `limit` bytes. Calls `on_chunk` with the running
/// total after every chunk; returns the total and whether the source ran out.
pub fn copy_bounded<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    limit: u64,
    mut on_chunk: F,
) -> io::Result<(u64, bool)>
where
    R: Read,
    W: Write,
    F: FnMut(u64),
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    while written < limit {
        let want = (limit - written).min(CHUNK_SIZE as u64) as usize;
        let n = read_chunk(reader, &mut buffer[..want])?;
        if n == 0 {
            writer.flush()?;
            return Ok((written, true));
        }

        writer.write_all(&buffer[..n])?;
        written += n as u64;
        on_chunk(written);

        if n < want {
            writer.flush()?;
            return Ok((written, true));
        }
    }

    writer.flush()?;
    Ok((written, false))
}
