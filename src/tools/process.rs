use crate::{RecoveryError, RecoveryResult};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fmt;
use std::io::{ErrorKind, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// A fully specified external tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Program file name without directories, for log fields
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How an external process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolExit {
    /// None when the process was ended by a signal
    pub code: Option<i32>,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ToolExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A running external process whose combined output is read line by line
pub trait ToolProcess: Send {
    /// Next non-empty output line, or None once all output has been consumed
    fn next_line(&mut self) -> Option<String>;

    /// Ask the process to stop
    fn terminate(&mut self) -> RecoveryResult<()>;

    /// Reap the process
    fn wait(&mut self) -> RecoveryResult<ToolExit>;
}

pub trait ToolLauncher: Send + Sync {
    fn launch(&self, command: &ToolCommand) -> RecoveryResult<Box<dyn ToolProcess>>;
}

/// Run `command` to completion, handing every output line to `on_line`
pub fn run_streaming<F>(
    launcher: &dyn ToolLauncher,
    command: &ToolCommand,
    mut on_line: F,
) -> RecoveryResult<ToolExit>
where
    F: FnMut(&str),
{
    tracing::debug!(command = %command, "Running external tool");

    let mut process = launcher.launch(command)?;
    while let Some(line) = process.next_line() {
        on_line(&line);
    }

    let exit = process.wait()?;
    tracing::debug!(tool = %command.program_name(), %exit, "External tool finished");
    Ok(exit)
}

/// Splits a byte stream into lines on both `\n` and `\r`
///
/// Progress-reporting tools redraw a single line with carriage returns and
/// backspaces; each redraw becomes its own line here.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(String)) {
        for &byte in bytes {
            match byte {
                b'\n' | b'\r' => self.flush(&mut emit),
                0x08 => {}
                _ => self.pending.push(byte),
            }
        }
    }

    pub(crate) fn finish(&mut self, mut emit: impl FnMut(String)) {
        self.flush(&mut emit);
    }

    fn flush(&mut self, emit: &mut impl FnMut(String)) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            emit(line);
        }
    }
}

fn pump<R: Read>(mut reader: R, tx: Sender<String>) {
    let mut buf = [0u8; 4096];
    let mut splitter = LineSplitter::default();
    let mut open = true;

    while open {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => splitter.push(&buf[..n], |line| {
                open &= tx.send(line).is_ok();
            }),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    splitter.finish(|line| {
        let _ = tx.send(line);
    });
}

/// Launches real processes with stdout and stderr merged
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ToolLauncher for SystemLauncher {
    fn launch(&self, command: &ToolCommand) -> RecoveryResult<Box<dyn ToolProcess>> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group: a terminal Ctrl+C reaches only nandfix, which
            // decides whether the tool may be stopped
            .process_group(0);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RecoveryError::DependencyUnavailable(format!(
                    "{} ({})",
                    command.program.display(),
                    e
                ))
            } else {
                RecoveryError::Io(e)
            }
        })?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || pump(stdout, tx)));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || pump(stderr, tx)));
        }
        drop(tx);

        Ok(Box::new(SystemProcess {
            child,
            lines: rx,
            readers,
        }))
    }
}

struct SystemProcess {
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl ToolProcess for SystemProcess {
    fn next_line(&mut self) -> Option<String> {
        self.lines.recv().ok()
    }

    fn terminate(&mut self) -> RecoveryResult<()> {
        let pid = Pid::from_raw(self.child.id() as i32);
        match kill(pid, Signal::SIGTERM) {
            Ok(()) => Ok(()),
            // Already exited
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(RecoveryError::Io(std::io::Error::from(e))),
        }
    }

    fn wait(&mut self) -> RecoveryResult<ToolExit> {
        let status = self.child.wait()?;

        // A killed tool may leave a grandchild holding the pipe open; don't block on it
        if status.success() {
            for reader in self.readers.drain(..) {
                let _ = reader.join();
            }
        }

        Ok(ToolExit {
            code: status.code(),
        })
    }
}
