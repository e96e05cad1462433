// Scripted launcher for unit tests

use super::process::{ToolCommand, ToolExit, ToolLauncher, ToolProcess};
use crate::RecoveryResult;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What a scripted tool prints and how it exits
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    pub lines: Vec<String>,
    pub exit_code: i32,
}

impl Scripted {
    pub fn ok<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            exit_code: 0,
        }
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            lines: vec!["ERROR".to_string()],
            exit_code,
        }
    }
}

type Handler = dyn Fn(&ToolCommand) -> Scripted + Send + Sync;

#[derive(Clone)]
pub struct ScriptedLauncher {
    handler: Arc<Handler>,
    commands: Arc<Mutex<Vec<ToolCommand>>>,
    terminations: Arc<AtomicUsize>,
    reads_after_terminate: Arc<AtomicUsize>,
}

impl ScriptedLauncher {
    pub fn new(handler: impl Fn(&ToolCommand) -> Scripted + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            commands: Arc::new(Mutex::new(Vec::new())),
            terminations: Arc::new(AtomicUsize::new(0)),
            reads_after_terminate: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn commands(&self) -> Vec<ToolCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn reads_after_terminate(&self) -> usize {
        self.reads_after_terminate.load(Ordering::SeqCst)
    }
}

impl ToolLauncher for ScriptedLauncher {
    fn launch(&self, command: &ToolCommand) -> RecoveryResult<Box<dyn ToolProcess>> {
        self.commands.lock().unwrap().push(command.clone());
        let script = (self.handler)(command);
        Ok(Box::new(ScriptedProcess {
            lines: script.lines.into(),
            exit_code: script.exit_code,
            terminated: false,
            terminations: Arc::clone(&self.terminations),
            reads_after_terminate: Arc::clone(&self.reads_after_terminate),
        }))
    }
}

struct ScriptedProcess {
    lines: VecDeque<String>,
    exit_code: i32,
    terminated: bool,
    terminations: Arc<AtomicUsize>,
    reads_after_terminate: Arc<AtomicUsize>,
}

impl ToolProcess for ScriptedProcess {
    fn next_line(&mut self) -> Option<String> {
        if self.terminated {
            self.reads_after_terminate.fetch_add(1, Ordering::SeqCst);
            return None;
        }
        self.lines.pop_front()
    }

    fn terminate(&mut self) -> RecoveryResult<()> {
        self.terminated = true;
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&mut self) -> RecoveryResult<ToolExit> {
        if self.terminated {
            Ok(ToolExit { code: None })
        } else {
            Ok(ToolExit {
                code: Some(self.exit_code),
            })
        }
    }
}
