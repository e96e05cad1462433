// Single-run slot and the dedicated worker a run executes on

use super::engine::{RecoveryFailure, RecoveryWorkflow, RunReport};
use crate::{Procedure, RecoveryError, RecoveryResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static RUN_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Held for the lifetime of a run; at most one exists per process
#[derive(Debug)]
pub struct RunSlot {
    _private: (),
}

impl RunSlot {
    pub fn acquire() -> RecoveryResult<Self> {
        RUN_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self { _private: () })
            .map_err(|_| RecoveryError::RunInProgress)
    }

    pub fn is_held() -> bool {
        RUN_ACTIVE.load(Ordering::SeqCst)
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        RUN_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Run `procedure` on a blocking worker so the caller's runtime stays responsive
pub async fn run_on_worker(
    workflow: Arc<RecoveryWorkflow>,
    procedure: Procedure,
) -> Result<RunReport, RecoveryFailure> {
    let slot = RunSlot::acquire().map_err(|e| RecoveryFailure::preflight(procedure, e))?;

    let joined = tokio::task::spawn_blocking(move || {
        let _slot = slot;
        workflow.run(procedure)
    })
    .await;

    match joined {
        Ok(result) => result,
        Err(e) => Err(RecoveryFailure::preflight(
            procedure,
            RecoveryError::Io(std::io::Error::other(format!("recovery worker failed: {}", e))),
        )),
    }
}
