//! DAG executor.
//!
//! The executor owns the [`TaskGraph`] for one run and drives it to
//! completion: it asks the [`AdmissionController`] how many slots are free,
//! picks among ready tasks with the [`PreemptionPolicy`], dispatches them to
//! a caller-supplied [`TaskRunner`] and feeds every outcome back into the
//! graph, the adaptive limiter and the retry classifier.
//!
//! The dependency mutation API is safe to call from other tasks while a run
//! is in progress. Every graph access goes through one short-held lock, so a
//! mutation is linearizable against the run loop's readiness checks.

use crate::admission::{Acquire, AdmissionController, LimitBreakdown, LimitInput, ObservationKind};
use crate::config::Config;
use crate::core::graph::{CycleReport, TaskGraph};
use crate::core::plan::TaskPlan;
use crate::core::task::{Priority, TaskId, TaskStatus};
use crate::core::weights::compute_weights;
use crate::error::Result;
use crate::orchestration::preemption::{Candidate, PreemptionPolicy, RunningTask};
use crate::orchestration::retry::{
    classify, resolve_aggregate_outcome, trim_diagnostic, Classification, EntityOutcome,
    OutcomeCode, RetryPolicy, TaskFailure, DEFAULT_DIAGNOSTIC_CHARS,
};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What a [`TaskRunner`] is handed for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Cancelled when the run is aborted or this attempt is preempted.
    /// Runners are expected to honor it and return promptly.
    pub cancel: CancellationToken,
}

/// What one attempt produces.
pub type RunOutput = std::result::Result<serde_json::Value, TaskFailure>;

/// Boxed attempt returned by [`TaskRunner::run`].
pub type RunFuture = BoxFuture<'static, RunOutput>;

/// Executes one task attempt.
///
/// Any `Fn(TaskContext) -> impl Future<Output = Result<Value, TaskFailure>>`
/// is a runner.
pub trait TaskRunner: Send + Sync + 'static {
    fn run(&self, ctx: TaskContext) -> RunFuture;
}

impl<F, Fut> TaskRunner for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RunOutput> + Send + 'static,
{
    fn run(&self, ctx: TaskContext) -> RunFuture {
        self(ctx).boxed()
    }
}

/// Events emitted by the executor for task lifecycle changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    /// Permanent failure, including dependents failed because a
    /// dependency failed.
    TaskFailed {
        task_id: TaskId,
        error: String,
        outcome: OutcomeCode,
    },
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
        outcome: OutcomeCode,
    },
    TaskPreempted {
        task_id: TaskId,
        by: TaskId,
    },
    RunFinished {
        status: OverallStatus,
    },
}

/// Final state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every task completed.
    Completed,
    /// Some tasks completed, some failed.
    Partial,
    /// Nothing completed.
    Failed,
    /// Cancelled before finishing.
    Aborted,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Completed => "completed",
            OverallStatus::Partial => "partial",
            OverallStatus::Failed => "failed",
            OverallStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`DagExecutor::run`].
///
/// Every task appears in exactly one of `completed_task_ids`,
/// `failed_task_ids` and `skipped_task_ids`, each in plan order.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub overall_status: OverallStatus,
    pub completed_task_ids: Vec<TaskId>,
    pub failed_task_ids: Vec<TaskId>,
    /// Tasks that never finished because the run was aborted.
    pub skipped_task_ids: Vec<TaskId>,
    /// Bounded diagnostic per failed task.
    pub failures: BTreeMap<TaskId, String>,
    pub outputs: BTreeMap<TaskId, serde_json::Value>,
    pub attempts: BTreeMap<TaskId, u32>,
    pub outcome: OutcomeCode,
    pub elapsed_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.overall_status == OverallStatus::Completed
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Keep per-task weights and use them to order equal-priority tasks.
    pub weighted_scheduling: bool,
    pub preemption: PreemptionPolicy,
    pub retry: RetryPolicy,
    /// Maximum length of a stored failure diagnostic.
    pub diagnostic_chars: usize,
    /// Admission key every task of this run is dispatched under.
    pub limit_input: LimitInput,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            weighted_scheduling: false,
            preemption: PreemptionPolicy::default(),
            retry: RetryPolicy::default(),
            diagnostic_chars: DEFAULT_DIAGNOSTIC_CHARS,
            limit_input: LimitInput::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            weighted_scheduling: config.weighted_scheduling,
            preemption: PreemptionPolicy::new(config.preemption_enabled),
            retry: config.retry_policy(),
            ..Default::default()
        }
    }

    pub fn with_limit_input(mut self, input: LimitInput) -> Self {
        self.limit_input = input;
        self
    }
}

struct Inner {
    plan_id: String,
    graph: Mutex<TaskGraph>,
    weights: Mutex<HashMap<TaskId, f64>>,
    config: ExecutorConfig,
    admission: Arc<AdmissionController>,
    cancel: CancellationToken,
    /// Wakes the run loop after a successful mutation.
    changed: Notify,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ExecutionEvent>>>,
}

/// Drives one plan's task graph to completion.
///
/// Cheap to clone; clones share the same graph, so a runner can hold one
/// and revise dependencies mid-run.
#[derive(Clone)]
pub struct DagExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DagExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagExecutor")
            .field("plan_id", &self.inner.plan_id)
            .field("graph", &*self.graph())
            .finish()
    }
}

/// A dispatched attempt.
struct Slot {
    priority: Priority,
    started: Instant,
    token: CancellationToken,
    preempted_by: Option<TaskId>,
}

struct Completion {
    id: TaskId,
    outcome: std::result::Result<RunOutput, JoinError>,
}

type InFlight = FuturesUnordered<BoxFuture<'static, Completion>>;

/// Per-run bookkeeping owned by the loop.
#[derive(Default)]
struct RunState {
    running: HashMap<TaskId, Slot>,
    /// Earliest dispatch time for tasks backing off or denied a permit.
    not_before: HashMap<TaskId, Instant>,
    classifications: HashMap<TaskId, Classification>,
    outputs: BTreeMap<TaskId, serde_json::Value>,
}

impl DagExecutor {
    /// Validate `plan` and build an executor for it.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPlan`](crate::Error::InvalidPlan) when the plan
    /// has structural errors.
    pub fn new(
        plan: &TaskPlan,
        config: ExecutorConfig,
        admission: Arc<AdmissionController>,
    ) -> Result<Self> {
        let graph = TaskGraph::from_plan(plan)?;
        Ok(Self::from_graph(plan.id.clone(), graph, config, admission))
    }

    pub fn from_graph(
        plan_id: impl Into<String>,
        graph: TaskGraph,
        config: ExecutorConfig,
        admission: Arc<AdmissionController>,
    ) -> Self {
        let executor = Self {
            inner: Arc::new(Inner {
                plan_id: plan_id.into(),
                graph: Mutex::new(graph),
                weights: Mutex::new(HashMap::new()),
                config,
                admission,
                cancel: CancellationToken::new(),
                changed: Notify::new(),
                subscribers: Mutex::new(Vec::new()),
            }),
        };
        {
            let graph = executor.graph();
            executor.refresh_weights(&graph);
        }
        executor
    }

    pub fn plan_id(&self) -> &str {
        &self.inner.plan_id
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Receive lifecycle events for subsequent runs.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers).push(tx);
        rx
    }

    /// Token that aborts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    // ========== Mutation API ==========

    /// Make `task` wait on `depends_on`.
    ///
    /// The edge is checked against the current graph before anything is
    /// written; on any error the graph is unchanged.
    ///
    /// # Errors
    /// Unknown task, self-dependency, duplicate edge, or an edge that would
    /// close a cycle.
    pub fn add_dependency(&self, task: &str, depends_on: &str) -> Result<()> {
        let mut graph = self.graph();
        if let Err(e) = graph.add_edge(task, depends_on) {
            tracing::warn!(
                task = %task,
                depends_on = %depends_on,
                error = %e,
                "dependency rejected"
            );
            return Err(e);
        }
        tracing::info!(task = %task, depends_on = %depends_on, "dependency added");
        self.refresh_weights(&graph);
        drop(graph);
        self.inner.changed.notify_one();
        Ok(())
    }

    /// Remove the edge `task -> depends_on`. Returns whether it existed.
    ///
    /// # Errors
    /// Only when either task is unknown.
    pub fn remove_dependency(&self, task: &str, depends_on: &str) -> Result<bool> {
        let mut graph = self.graph();
        let removed = graph.remove_edge(task, depends_on)?;
        if removed {
            tracing::info!(task = %task, depends_on = %depends_on, "dependency removed");
            self.refresh_weights(&graph);
            drop(graph);
            self.inner.changed.notify_one();
        }
        Ok(removed)
    }

    /// Full-graph cycle check, independent of the guarded mutation path.
    pub fn detect_cycle(&self) -> CycleReport {
        self.graph().detect_cycle()
    }

    // ========== Queries ==========

    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.graph().ready_tasks()
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.graph().status(id).cloned()
    }

    pub fn dependencies_of(&self, id: &str) -> Option<Vec<TaskId>> {
        self.graph()
            .dependencies_of(id)
            .map(|deps| deps.iter().cloned().collect())
    }

    /// A copy of the graph as it is now.
    pub fn graph_snapshot(&self) -> TaskGraph {
        self.graph().clone()
    }

    pub fn weights(&self) -> HashMap<TaskId, f64> {
        lock(&self.inner.weights).clone()
    }

    pub fn effective_limit(&self) -> LimitBreakdown {
        self.inner
            .admission
            .effective_limit(&self.inner.config.limit_input)
    }

    // ========== Run Loop ==========

    /// Run every task to a terminal state, or until cancelled.
    ///
    /// Concurrency is bounded by the admission controller's effective limit,
    /// re-read on every tick. Failed attempts are retried per the configured
    /// [`RetryPolicy`]; permanent failures fail everything blocked behind
    /// them.
    ///
    /// # Errors
    /// Only on an internal bookkeeping failure. Every in-flight attempt is
    /// cancelled and awaited before the error is returned.
    pub async fn run<R: TaskRunner>(&self, runner: R) -> Result<ExecutionResult> {
        let runner = Arc::new(runner);
        let started = Instant::now();
        let mut state = RunState::default();
        let mut in_flight = InFlight::new();
        let mut aborted = false;
        let mut fault = None;

        tracing::info!(
            plan_id = %self.inner.plan_id,
            tasks = self.graph().len(),
            "run started"
        );

        loop {
            if self.inner.cancel.is_cancelled() {
                aborted = true;
                break;
            }

            self.fail_blocked(&mut state);
            if in_flight.is_empty() && self.graph().all_terminal() {
                break;
            }

            self.dispatch_ready(&runner, &mut state, &mut in_flight);
            self.preempt_if_needed(&mut state);

            let next_wake = self.next_wake(&state);
            if in_flight.is_empty() && next_wake.is_none() {
                // A task skipped this tick because a mutation got there first
                // leaves others ready; only an empty ready set is a stall.
                if self.graph().ready_tasks().is_empty() {
                    self.fail_stalled();
                }
                continue;
            }
            let wake_at = next_wake.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    aborted = true;
                    break;
                }
                Some(done) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(e) = self.handle_completion(done, &mut state) {
                        fault = Some(e);
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake_at), if next_wake.is_some() => {}
                _ = self.inner.changed.notified() => {
                    tracing::debug!("graph changed; re-evaluating readiness");
                }
            }
        }

        if let Some(e) = fault {
            tracing::error!(
                plan_id = %self.inner.plan_id,
                in_flight = in_flight.len(),
                error = %e,
                "run failed; stopping in-flight tasks"
            );
            self.drain(&mut state, &mut in_flight).await;
            self.emit(ExecutionEvent::RunFinished {
                status: OverallStatus::Aborted,
            });
            return Err(e);
        }

        if aborted {
            tracing::warn!(
                plan_id = %self.inner.plan_id,
                in_flight = in_flight.len(),
                "run cancelled; waiting for in-flight tasks"
            );
            self.drain(&mut state, &mut in_flight).await;
        }

        let result = self.build_result(state, aborted, started.elapsed());
        tracing::info!(
            plan_id = %result.plan_id,
            status = %result.overall_status,
            completed = result.completed_task_ids.len(),
            failed = result.failed_task_ids.len(),
            skipped = result.skipped_task_ids.len(),
            elapsed_ms = result.elapsed_ms,
            "run finished"
        );
        self.emit(ExecutionEvent::RunFinished {
            status: result.overall_status,
        });
        Ok(result)
    }

    fn dispatch_ready<R: TaskRunner>(
        &self,
        runner: &Arc<R>,
        state: &mut RunState,
        in_flight: &mut InFlight,
    ) {
        let now = Instant::now();
        let breakdown = self.effective_limit();
        let limit = breakdown.effective_limit as usize;
        let free = limit.saturating_sub(state.running.len());

        let candidates = self.candidates(state, now);
        if candidates.is_empty() || free == 0 {
            return;
        }
        let weights = lock(&self.inner.weights).clone();
        let selected = self.inner.config.preemption.select(&candidates, free, &weights);
        tracing::debug!(
            ready = candidates.len(),
            slots = free,
            limit,
            selected = selected.len(),
            "dispatch tick"
        );

        let input = &self.inner.config.limit_input;
        for id in selected {
            let acquire = self.inner.admission.try_acquire(&input.provider, &input.model);
            if let Acquire::Wait(wait) = acquire {
                let wait_ms = wait.as_millis() as u64;
                tracing::debug!(task = %id, wait_ms, "rate limited; deferring");
                state.not_before.insert(id, now + wait);
                continue;
            }
            self.dispatch(runner, id, state, in_flight);
        }
    }

    /// Start one attempt. Readiness is re-checked under the same lock that
    /// marks the task running, since a mutation may have landed after the
    /// candidates were read. Returns whether the task was started.
    fn dispatch<R: TaskRunner>(
        &self,
        runner: &Arc<R>,
        id: TaskId,
        state: &mut RunState,
        in_flight: &mut InFlight,
    ) -> bool {
        let ctx = {
            let mut graph = self.graph();
            let Some(node) = graph.node(&id) else {
                return false;
            };
            if !matches!(node.status, TaskStatus::Ready) {
                tracing::debug!(
                    task = %id,
                    status = %node.status,
                    "task no longer ready; skipping"
                );
                return false;
            }
            let ctx = TaskContext {
                id: id.clone(),
                description: node.description.clone(),
                priority: node.priority,
                attempt: node.attempts + 1,
                cancel: self.inner.cancel.child_token(),
            };
            if let Err(e) = graph.mark_running(&id) {
                tracing::warn!(task = %id, error = %e, "task could not be started");
                return false;
            }
            ctx
        };
        state.not_before.remove(&id);
        state.running.insert(
            id.clone(),
            Slot {
                priority: ctx.priority,
                started: Instant::now(),
                token: ctx.cancel.clone(),
                preempted_by: None,
            },
        );

        tracing::info!(
            task = %id,
            attempt = ctx.attempt,
            priority = %ctx.priority,
            "task dispatched"
        );
        self.emit(ExecutionEvent::TaskStarted {
            task_id: id.clone(),
            attempt: ctx.attempt,
        });

        let handle = tokio::spawn(runner.run(ctx));
        in_flight.push(
            async move {
                Completion {
                    id,
                    outcome: handle.await,
                }
            }
            .boxed(),
        );
        true
    }

    /// Ready tasks not currently backing off.
    fn candidates(&self, state: &RunState, now: Instant) -> Vec<Candidate> {
        let graph = self.graph();
        graph
            .ready_tasks()
            .into_iter()
            .filter(|id| state.not_before.get(id).map_or(true, |at| *at <= now))
            .filter_map(|id| {
                let priority = graph.node(&id)?.priority;
                Some(Candidate { id, priority })
            })
            .collect()
    }

    /// With every slot busy, interrupt the weakest running task if the best
    /// ready task dominates it. At most one preemption is outstanding.
    fn preempt_if_needed(&self, state: &mut RunState) {
        let policy = self.inner.config.preemption;
        if !policy.is_enabled() || state.running.values().any(|s| s.preempted_by.is_some()) {
            return;
        }
        let limit = self.effective_limit().effective_limit as usize;
        if state.running.len() < limit {
            return;
        }

        let candidates = self.candidates(state, Instant::now());
        let weights = lock(&self.inner.weights).clone();
        let Some(best) = policy.select(&candidates, 1, &weights).into_iter().next() else {
            return;
        };
        let Some(incoming) = candidates.iter().find(|c| c.id == best).map(|c| c.priority) else {
            return;
        };

        let mut running: Vec<(&TaskId, &Slot)> = state.running.iter().collect();
        running.sort_by_key(|(_, slot)| slot.started);
        let running: Vec<RunningTask> = running
            .into_iter()
            .map(|(id, slot)| RunningTask {
                id: id.clone(),
                priority: slot.priority,
            })
            .collect();

        let Some(victim) = policy.find_victim(&running, incoming).map(|v| v.id.clone()) else {
            return;
        };
        if let Some(slot) = state.running.get_mut(&victim) {
            tracing::info!(task = %victim, by = %best, "preempting task");
            slot.token.cancel();
            slot.preempted_by = Some(best.clone());
            self.emit(ExecutionEvent::TaskPreempted {
                task_id: victim,
                by: best,
            });
        }
    }

    fn handle_completion(&self, done: Completion, state: &mut RunState) -> Result<()> {
        let Completion { id, outcome } = done;
        let Some(slot) = state.running.remove(&id) else {
            return Ok(());
        };
        let latency_ms = slot.started.elapsed().as_millis() as u64;
        let input = &self.inner.config.limit_input;

        let failure = match flatten(outcome) {
            Ok(value) => {
                let newly_ready = self.graph().mark_completed(&id)?;
                self.inner.admission.observe(
                    &input.provider,
                    &input.model,
                    ObservationKind::Success { latency_ms },
                );
                tracing::info!(
                    task = %id,
                    latency_ms,
                    unblocked = newly_ready.len(),
                    "task completed"
                );
                state.outputs.insert(id.clone(), value);
                self.emit(ExecutionEvent::TaskCompleted { task_id: id });
                return Ok(());
            }
            Err(failure) => failure,
        };

        if slot.preempted_by.is_some() {
            tracing::info!(task = %id, "preempted task returned to queue");
            self.graph().requeue(&id, false)?;
            return Ok(());
        }

        let classification = classify(&failure);
        if let Some(kind) = observation_for(&failure, classification.code, latency_ms) {
            self.inner.admission.observe(&input.provider, &input.model, kind);
        }

        let attempts = self.graph().node(&id).map_or(0, |n| n.attempts) + 1;
        let policy = &self.inner.config.retry;
        if policy.should_retry(classification, attempts) {
            let delay = policy.delay_for(&failure, attempts);
            tracing::warn!(
                task = %id,
                attempt = attempts,
                outcome = %classification.code,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "task failed; retrying"
            );
            self.graph().requeue(&id, true)?;
            state.not_before.insert(id.clone(), Instant::now() + delay);
            self.emit(ExecutionEvent::TaskRetrying {
                task_id: id,
                attempt: attempts,
                delay,
                outcome: classification.code,
            });
            return Ok(());
        }

        let diagnostic = trim_diagnostic(&failure.to_string(), self.inner.config.diagnostic_chars);
        tracing::warn!(
            task = %id,
            attempt = attempts,
            outcome = %classification.code,
            error = %diagnostic,
            "task failed"
        );
        let blocked = self.graph().mark_failed(&id, &diagnostic)?;
        state.classifications.insert(id.clone(), classification);
        self.emit(ExecutionEvent::TaskFailed {
            task_id: id,
            error: diagnostic,
            outcome: classification.code,
        });
        self.report_blocked(blocked, state);
        Ok(())
    }

    /// Cancel every in-flight attempt and wait for all of them, so no runner
    /// outlives the run and no task is left `Running`.
    async fn drain(&self, state: &mut RunState, in_flight: &mut InFlight) {
        for slot in state.running.values() {
            slot.token.cancel();
        }
        while let Some(done) = in_flight.next().await {
            self.handle_drained(done, state);
        }
    }

    /// In-flight attempts finishing after cancellation. Successes still
    /// count; anything else is left unfinished.
    fn handle_drained(&self, done: Completion, state: &mut RunState) {
        let Completion { id, outcome } = done;
        state.running.remove(&id);
        match flatten(outcome) {
            Ok(value) => match self.graph().mark_completed(&id) {
                Ok(_) => {
                    state.outputs.insert(id.clone(), value);
                    self.emit(ExecutionEvent::TaskCompleted { task_id: id });
                }
                Err(e) => tracing::warn!(task = %id, error = %e, "drained result dropped"),
            },
            Err(failure) => {
                tracing::debug!(task = %id, error = %failure, "in-flight task stopped");
                if let Err(e) = self.graph().requeue(&id, false) {
                    tracing::warn!(task = %id, error = %e, "drained task not requeued");
                }
            }
        }
    }

    /// Fail tasks waiting on a failed dependency. Mutations can attach a
    /// task to an already failed one, so this runs every tick.
    fn fail_blocked(&self, state: &mut RunState) {
        let blocked = self.graph().propagate_failures();
        self.report_blocked(blocked, state);
    }

    fn report_blocked(&self, blocked: Vec<TaskId>, state: &mut RunState) {
        for id in blocked {
            let error = match self.graph().status(&id) {
                Some(TaskStatus::Failed { error }) => error.clone(),
                _ => continue,
            };
            tracing::warn!(task = %id, error = %error, "task blocked");
            state
                .classifications
                .insert(id.clone(), OutcomeCode::NonretryableFailure.into());
            self.emit(ExecutionEvent::TaskFailed {
                task_id: id,
                error,
                outcome: OutcomeCode::NonretryableFailure,
            });
        }
    }

    /// Nothing running, nothing ready or waiting, yet tasks remain. Only a
    /// graph mutated outside the guarded API can get here.
    fn fail_stalled(&self) {
        let mut graph = self.graph();
        let stuck: Vec<TaskId> = graph
            .nodes()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.id.clone())
            .collect();
        tracing::warn!(tasks = stuck.len(), "run stalled; failing unreachable tasks");
        for id in stuck {
            // Already-failed dependents are skipped by mark_failed's propagation.
            if graph.status(&id).is_some_and(|s| !s.is_terminal()) {
                let _ = graph.mark_failed(&id, "stalled: dependencies can never complete");
            }
        }
    }

    fn next_wake(&self, state: &RunState) -> Option<Instant> {
        let graph = self.graph();
        state
            .not_before
            .iter()
            .filter(|(id, _)| matches!(graph.status(id), Some(TaskStatus::Ready)))
            .map(|(_, at)| *at)
            .min()
    }

    fn build_result(&self, state: RunState, aborted: bool, elapsed: Duration) -> ExecutionResult {
        let graph = self.graph();
        let mut result = ExecutionResult {
            plan_id: self.inner.plan_id.clone(),
            overall_status: OverallStatus::Completed,
            completed_task_ids: Vec::new(),
            failed_task_ids: Vec::new(),
            skipped_task_ids: Vec::new(),
            failures: BTreeMap::new(),
            outputs: state.outputs,
            attempts: BTreeMap::new(),
            outcome: OutcomeCode::Success,
            elapsed_ms: elapsed.as_millis() as u64,
        };
        let mut outcomes = Vec::new();

        for node in graph.nodes() {
            result.attempts.insert(node.id.clone(), node.attempts);
            match &node.status {
                TaskStatus::Completed => {
                    result.completed_task_ids.push(node.id.clone());
                    outcomes.push(EntityOutcome::Succeeded);
                }
                TaskStatus::Failed { error } => {
                    result.failed_task_ids.push(node.id.clone());
                    result.failures.insert(node.id.clone(), error.clone());
                    let classification = state
                        .classifications
                        .get(&node.id)
                        .copied()
                        .unwrap_or_else(|| OutcomeCode::NonretryableFailure.into());
                    outcomes.push(classification.into());
                }
                _ => result.skipped_task_ids.push(node.id.clone()),
            }
        }

        result.overall_status = if aborted {
            OverallStatus::Aborted
        } else if result.failed_task_ids.is_empty() {
            OverallStatus::Completed
        } else if result.completed_task_ids.is_empty() {
            OverallStatus::Failed
        } else {
            OverallStatus::Partial
        };
        result.outcome = if aborted {
            OutcomeCode::Cancelled
        } else {
            resolve_aggregate_outcome(&outcomes)
        };
        result
    }

    // ========== Internals ==========

    fn graph(&self) -> MutexGuard<'_, TaskGraph> {
        lock(&self.inner.graph)
    }

    /// Weights are advisory: a failure keeps the previous map and never
    /// fails the caller.
    fn refresh_weights(&self, graph: &TaskGraph) {
        if !self.inner.config.weighted_scheduling {
            return;
        }
        match compute_weights(graph) {
            Ok(weights) => *lock(&self.inner.weights) = weights,
            Err(e) => tracing::warn!(error = %e, "weight recomputation failed"),
        }
    }

    fn emit(&self, event: ExecutionEvent) {
        lock(&self.inner.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn flatten(outcome: std::result::Result<RunOutput, JoinError>) -> RunOutput {
    match outcome {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(TaskFailure::Cancelled),
        Err(e) => Err(TaskFailure::msg(format!("task panicked: {e}"))),
    }
}

/// Pressure signal fed back to the adaptive limiter for a failure.
fn observation_for(
    failure: &TaskFailure,
    code: OutcomeCode,
    latency_ms: u64,
) -> Option<ObservationKind> {
    match code {
        OutcomeCode::Cancelled => None,
        OutcomeCode::RateLimit => {
            let wait_ms = match failure {
                TaskFailure::RateLimited {
                    retry_after_ms: Some(ms),
                } => *ms,
                _ => 0,
            };
            Some(ObservationKind::RateLimit { wait_ms })
        }
        OutcomeCode::Timeout => Some(ObservationKind::Timeout { latency_ms }),
        _ => Some(ObservationKind::Error),
    }
}
