// Crash record for unexpected panics
//
// The record is appended to `error_log.txt` so the last failures survive
// across runs and can be attached to a bug report.

use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::any::Any;
use std::io::{self, Write};
use std::panic::{Location, PanicHookInfo};
use std::path::{Path, PathBuf};

pub const CRASH_LOG_NAME: &str = "error_log.txt";

/// Append one timestamped crash record to `path`
pub fn append_record(path: &Path, message: &str, backtrace: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "--- {} ---", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(file, "{}", message)?;
    if !backtrace.is_empty() {
        writeln!(file, "{}", backtrace)?;
    }
    writeln!(file)?;
    file.sync_all()
}

fn describe(info: &PanicHookInfo<'_>) -> String {
    describe_parts(info.payload(), info.location())
}

fn describe_parts(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> String {
    let payload = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());

    match location {
        Some(location) => format!(
            "panic at {}:{}: {}",
            location.file(),
            location.line(),
            payload
        ),
        None => format!("panic: {}", payload),
    }
}

/// Record every panic to `dir/error_log.txt`, tell the user where it went,
/// and terminate the process
pub fn install_panic_hook(dir: PathBuf) {
    std::panic::set_hook(Box::new(move |info| {
        let message = describe(info);
        let backtrace = Backtrace::force_capture().to_string();
        let path = dir.join(CRASH_LOG_NAME);

        tracing::error!(%message, "Unexpected crash");
        match append_record(&path, &message, &backtrace) {
            Ok(()) => eprintln!(
                "A critical error occurred:\n\n{}\n\nPlease check {} for more details.",
                message,
                path.display()
            ),
            Err(e) => eprintln!("A critical error occurred:\n\n{}\n\n{}", message, e),
        }
        std::process::exit(1);
    }));
}
