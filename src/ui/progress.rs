// Terminal progress sink
//
// Tool output lines go to stdout and to the run transcript. Percentages drive
// an indicatif bar per task when stdout is a terminal, and are printed as
// plain 10% steps otherwise.

use crate::ProgressSink;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

const BAR_TEMPLATE: &str = "{msg:<28} [{bar:40.cyan/blue}] {pos:>3}% ({elapsed})";

struct ActiveTask {
    name: String,
    bar: Option<ProgressBar>,
    last_reported: Option<u8>,
}

pub struct ConsoleSink {
    bars_enabled: bool,
    active: Mutex<Option<ActiveTask>>,
}

impl ConsoleSink {
    /// `interactive` is whether bars may be drawn; they never are when the
    /// crate is built without the `progress-bars` feature
    pub fn new(interactive: bool) -> Self {
        Self {
            bars_enabled: cfg!(feature = "progress-bars") && interactive,
            active: Mutex::new(None),
        }
    }

    /// Bars if stdout is a terminal
    pub fn for_stdout() -> Self {
        Self::new(console::Term::stdout().is_term())
    }

    fn new_bar(&self, task: &str) -> Option<ProgressBar> {
        if !self.bars_enabled {
            return None;
        }
        let bar = ProgressBar::new(100);
        if let Ok(bar_style) = ProgressStyle::with_template(BAR_TEMPLATE) {
            bar.set_style(bar_style.progress_chars("##-"));
        }
        bar.set_message(task.to_string());
        Some(bar)
    }

    fn close(task: ActiveTask) {
        match task.bar {
            Some(bar) => bar.finish(),
            None => {
                if task.last_reported != Some(100) {
                    println!("{}: done", task.name);
                }
            }
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn line(&self, line: &str) {
        tracing::info!(target: "nandfix::tool", "{}", line);
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.as_ref().and_then(|t| t.bar.as_ref()) {
            Some(bar) => bar.suspend(|| println!("{}", line)),
            None => println!("{}", line),
        }
    }

    fn progress(&self, task: &str, percent: u8) {
        let percent = percent.min(100);
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());

        if active.as_ref().map(|t| t.name != task).unwrap_or(true) {
            if let Some(previous) = active.take() {
                Self::close(previous);
            }
            tracing::debug!(task, "Progress started");
            *active = Some(ActiveTask {
                name: task.to_string(),
                bar: self.new_bar(task),
                last_reported: None,
            });
        }

        if let Some(current) = active.as_mut() {
            match &current.bar {
                Some(bar) => bar.set_position(percent as u64),
                None => {
                    if let Some(step) = text_step(current.last_reported, percent) {
                        println!("{}: {}%", task, step);
                        current.last_reported = Some(step);
                    }
                }
            }
        }
    }

    fn finish(&self, task: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().map(|t| t.name == task).unwrap_or(false) {
            if let Some(current) = active.take() {
                Self::close(current);
            }
        }
    }

    fn step_started(&self, index: usize, total: usize, description: &str) {
        println!(
            "\n{} {}",
            style(format!("[STEP {}/{}]", index, total)).bold().cyan(),
            description
        );
    }

    fn step_finished(&self, index: usize, description: &str, elapsed: Duration) {
        tracing::debug!(step = index, elapsed = %format_duration(elapsed.as_secs()), "{} done", description);
    }
}

/// The 10% mark to print in text mode, if `percent` has crossed a new one
pub(crate) fn text_step(last: Option<u8>, percent: u8) -> Option<u8> {
    let step = percent / 10 * 10;
    match last {
        Some(previous) if step <= previous => None,
        _ => Some(step),
    }
}

/// Convert bytes/sec to readable string
pub fn human_bytes(bps: f64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    if bps <= 0.0 {
        return "0B".to_string();
    }
    let mut val = bps;
    let mut i = 0usize;
    while val >= 1024.0 && i + 1 < units.len() {
        val /= 1024.0;
        i += 1;
    }
    format!("{:.2}{}", val, units[i])
}

/// Format seconds to H:MM:SS or M:SS
pub fn format_duration(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{}:{:02}:{:02}", h, m, s)
    } else {
        format!("{}:{:02}", m, s)
    }
}
