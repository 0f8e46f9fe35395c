//! Orchestration layer.
//!
//! The [`DagExecutor`] drives a task graph to completion, choosing among
//! ready tasks with the [`PreemptionPolicy`] and deciding retries with the
//! classifier in [`retry`].

mod executor;
mod preemption;
pub mod retry;

pub use executor::{
    DagExecutor, ExecutionEvent, ExecutionResult, ExecutorConfig, OverallStatus, RunFuture,
    RunOutput, TaskContext, TaskRunner,
};
pub use preemption::{preemptible_by, Candidate, PreemptionPolicy, RunningTask};
pub use retry::{
    classify, classify_text, resolve_aggregate_outcome, trim_diagnostic, BackoffConfig,
    Classification, EntityOutcome, JitterMode, OutcomeCode, RetryPolicy, TaskFailure,
};
