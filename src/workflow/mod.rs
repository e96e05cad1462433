// Recovery workflow: per-procedure plans, the engine that runs them, and the
// single-run worker

pub mod engine;
pub mod plan;
pub mod runner;


pub use engine::{
    Collaborators, Confirmer, RecoveryFailure, RecoveryWorkflow, RunOutcome, RunReport,
};
pub use plan::{plan_for, FlashPlan, FlashSource, FlashTarget, ImageRef, Step, Truncation};
pub use runner::{run_on_worker, RunSlot};
