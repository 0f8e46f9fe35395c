//! Run loop tests: ordering, concurrency, retries, preemption and
//! cancellation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempo::core::{Priority, TaskId, TaskPlan};
use tempo::orchestration::{
    BackoffConfig, DagExecutor, ExecutionEvent, ExecutorConfig, OutcomeCode, OverallStatus,
    PreemptionPolicy, RetryPolicy, TaskContext, TaskFailure,
};

use crate::fixtures::{
    admission, chain_plan, diamond_plan, executor, executor_config, independent_plan,
    init_tracing, prioritized, task, Recorder,
};

fn ids(ids: &[&str]) -> Vec<TaskId> {
    ids.iter().map(|id| TaskId::from(*id)).collect()
}

/// Test: Diamond execution order
/// Given a -> {b, c} -> d
/// When the plan runs
/// Then a finishes before b and c start, and both finish before d starts
#[tokio::test(start_paused = true)]
async fn test_diamond_respects_dependencies() {
    init_tracing();
    let recorder = Recorder::new();
    let exec = executor(&diamond_plan(), 4);

    let result = exec.run(recorder.runner(Duration::from_millis(10))).await.unwrap();

    assert_eq!(result.overall_status, OverallStatus::Completed);
    assert_eq!(result.completed_task_ids, ids(&["a", "b", "c", "d"]));
    assert!(result.failed_task_ids.is_empty());
    assert!(recorder.finished_before_start("a", "b"));
    assert!(recorder.finished_before_start("a", "c"));
    assert!(recorder.finished_before_start("b", "d"));
    assert!(recorder.finished_before_start("c", "d"));
    // b and c overlap
    assert_eq!(recorder.peak(), 2);
}

/// Test: Chain execution is a total order
/// Given a chain of 10 tasks
/// When the plan runs with plenty of slots
/// Then tasks start in chain order, one at a time
#[tokio::test(start_paused = true)]
async fn test_chain_runs_in_order() {
    init_tracing();
    let recorder = Recorder::new();
    let exec = executor(&chain_plan(10), 4);

    let result = exec.run(recorder.runner(Duration::from_millis(5))).await.unwrap();

    assert!(result.is_success());
    let expected: Vec<String> = (0..10).map(|i| format!("t{}", i)).collect();
    assert_eq!(recorder.started(), expected);
    assert_eq!(recorder.peak(), 1);
    for i in 1..10 {
        assert!(recorder.finished_before_start(&format!("t{}", i - 1), &format!("t{}", i)));
    }
}

/// Test: Concurrency respects the admission limit
/// Given 6 independent tasks and a limit of 3
/// When the plan runs
/// Then exactly 3 run at once
#[tokio::test(start_paused = true)]
async fn test_parallel_respects_limit() {
    init_tracing();
    let recorder = Recorder::new();
    let exec = executor(&independent_plan(6), 3);

    let result = exec.run(recorder.runner(Duration::from_millis(20))).await.unwrap();

    assert_eq!(result.completed_task_ids.len(), 6);
    assert_eq!(recorder.peak(), 3);
}

/// Test: Priority orders selection when slots are scarce
/// Given three independent tasks of different priority and one slot
/// When the plan runs
/// Then they start highest priority first
#[tokio::test(start_paused = true)]
async fn test_priority_orders_dispatch() {
    init_tracing();
    let plan = TaskPlan::new(
        "priorities",
        vec![
            prioritized("low", &[], Priority::Low),
            prioritized("critical", &[], Priority::Critical),
            prioritized("normal", &[], Priority::Normal),
        ],
    );
    let recorder = Recorder::new();
    let exec = executor(&plan, 1);

    exec.run(recorder.runner(Duration::from_millis(5))).await.unwrap();

    assert_eq!(recorder.started(), vec!["critical", "normal", "low"]);
}

/// Test: Retry budget is bounded
/// Given a task that always times out and a budget of 2 retries
/// When the plan runs
/// Then it is attempted 3 times and reported as a retryable failure
#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    init_tracing();
    let plan = TaskPlan::new("retry", vec![task("slow", &[]), task("after", &["slow"])]);
    let config = ExecutorConfig {
        retry: RetryPolicy {
            max_retries: 2,
            backoff: BackoffConfig::default(),
        },
        ..executor_config()
    };
    let exec = DagExecutor::new(&plan, config, admission(2)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let result = exec
        .run(move |_ctx: TaskContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<serde_json::Value, _>(TaskFailure::Timeout { elapsed_ms: 30_000 })
            }
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.overall_status, OverallStatus::Failed);
    assert_eq!(result.failed_task_ids, ids(&["slow", "after"]));
    assert_eq!(result.attempts[&TaskId::from("slow")], 3);
    assert!(result.failures[&TaskId::from("slow")].contains("timed out"));
    assert_eq!(result.outcome, OutcomeCode::RetryableFailure);
}

/// Test: Backoff delays retries
/// Given a task that fails once with a retryable error
/// When the plan runs with a 1s initial backoff
/// Then the run takes at least 1s of (virtual) time
#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_backoff() {
    init_tracing();
    let plan = TaskPlan::new("backoff", vec![task("flaky", &[])]);
    let exec = DagExecutor::new(
        &plan,
        ExecutorConfig {
            retry: RetryPolicy {
                max_retries: 1,
                backoff: BackoffConfig::default(),
            },
            ..executor_config()
        },
        admission(1),
    )
    .unwrap();
    let mut events = exec.subscribe();
    let started = tokio::time::Instant::now();

    let result = exec
        .run(|ctx: TaskContext| async move {
            if ctx.attempt == 1 {
                Err(TaskFailure::msg("503 service unavailable"))
            } else {
                Ok(serde_json::Value::Null)
            }
        })
        .await
        .unwrap();

    assert!(result.is_success());
    assert!(started.elapsed() >= Duration::from_millis(1000));
    let mut retried = false;
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::TaskRetrying { delay, outcome, .. } = event {
            assert_eq!(delay, Duration::from_millis(1000));
            assert_eq!(outcome, OutcomeCode::RetryableFailure);
            retried = true;
        }
    }
    assert!(retried);
}

/// Test: Failure diagnostics are bounded
/// Given a task failing with a huge message
/// When the plan runs
/// Then the stored diagnostic is trimmed
#[tokio::test]
async fn test_failure_diagnostic_is_trimmed() {
    init_tracing();
    let plan = TaskPlan::new("noisy", vec![task("noisy", &[])]);
    let exec = executor(&plan, 1);

    let result = exec
        .run(|_ctx: TaskContext| async move {
            Err::<serde_json::Value, _>(TaskFailure::msg("boom ".repeat(1000)))
        })
        .await
        .unwrap();

    let diagnostic = &result.failures[&TaskId::from("noisy")];
    assert_eq!(diagnostic.chars().count(), 500);
    assert!(diagnostic.ends_with("..."));
    assert_eq!(result.outcome, OutcomeCode::NonretryableFailure);
}

/// Test: Cancellation aborts the run
/// Given a chain whose first task never finishes on its own
/// When the run is cancelled
/// Then the run reports aborted and nothing is left ambiguous
#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_run() {
    init_tracing();
    let exec = executor(&chain_plan(3), 2);
    let token = exec.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let result = exec
        .run(|ctx: TaskContext| async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(TaskFailure::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(serde_json::Value::Null),
            }
        })
        .await
        .unwrap();

    assert_eq!(result.overall_status, OverallStatus::Aborted);
    assert_eq!(result.outcome, OutcomeCode::Cancelled);
    assert!(result.completed_task_ids.is_empty());
    assert!(result.failed_task_ids.is_empty());
    assert_eq!(result.skipped_task_ids, ids(&["t0", "t1", "t2"]));
    assert_eq!(result.attempts[&TaskId::from("t0")], 0);
}

/// Test: Preemption interrupts lower-priority work
/// Given one slot held by a background task
/// When a critical task becomes ready mid-run and preemption is enabled
/// Then the background task is interrupted, re-queued without losing an
/// attempt, and finishes after the critical task
#[tokio::test(start_paused = true)]
async fn test_preemption_requeues_victim() {
    init_tracing();
    let (result, recorder, preempted) = run_preemption_scenario(true).await;

    assert!(result.is_success());
    assert_eq!(
        preempted,
        vec![(TaskId::from("bg"), TaskId::from("urgent"))]
    );
    assert_eq!(recorder.started(), vec!["bg", "urgent", "bg", "blocker"]);
    assert_eq!(result.attempts[&TaskId::from("bg")], 1);
}

/// Test: Preemption is opt-in
/// Given the same scenario with preemption disabled
/// When the plan runs
/// Then the background task is never interrupted
#[tokio::test(start_paused = true)]
async fn test_preemption_disabled_never_interrupts() {
    init_tracing();
    let (result, recorder, preempted) = run_preemption_scenario(false).await;

    assert!(result.is_success());
    assert!(preempted.is_empty());
    assert_eq!(recorder.started(), vec!["bg", "urgent", "blocker"]);
}

/// `bg` (background) runs alone; when it starts it unblocks `urgent`
/// (critical) by removing its dependency on `blocker`.
async fn run_preemption_scenario(
    enabled: bool,
) -> (tempo::ExecutionResult, Arc<Recorder>, Vec<(TaskId, TaskId)>) {
    let plan = TaskPlan::new(
        "preemption",
        vec![
            prioritized("bg", &[], Priority::Background),
            prioritized("blocker", &["bg"], Priority::Normal),
            prioritized("urgent", &["blocker"], Priority::Critical),
        ],
    );
    let config = ExecutorConfig {
        preemption: PreemptionPolicy::new(enabled),
        ..executor_config()
    };
    let exec = DagExecutor::new(&plan, config, admission(1)).unwrap();
    let mut events = exec.subscribe();
    let recorder = Recorder::new();

    let handle = exec.clone();
    let rec = Arc::clone(&recorder);
    let result = exec
        .run(move |ctx: TaskContext| {
            let handle = handle.clone();
            let rec = Arc::clone(&rec);
            async move {
                rec.start(ctx.id.as_str());
                if ctx.id.as_str() == "bg" {
                    handle.remove_dependency("urgent", "blocker").unwrap();
                }
                let outcome = tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(TaskFailure::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(1)) => Ok(serde_json::Value::Null),
                };
                rec.finish(ctx.id.as_str());
                outcome
            }
        })
        .await
        .unwrap();

    let mut preempted = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::TaskPreempted { task_id, by } = event {
            preempted.push((task_id, by));
        }
    }
    (result, recorder, preempted)
}

/// Test: Event stream covers the lifecycle
/// Given a two-task chain whose root fails permanently
/// When the plan runs
/// Then events report the start, both failures and the finish
#[tokio::test]
async fn test_events_report_blocked_dependents() {
    init_tracing();
    let plan = TaskPlan::new("events", vec![task("root", &[]), task("leaf", &["root"])]);
    let exec = executor(&plan, 2);
    let mut events = exec.subscribe();

    exec.run(|_ctx: TaskContext| async move {
        Err::<serde_json::Value, _>(TaskFailure::Http {
            status: 403,
            message: "forbidden".to_string(),
        })
    })
    .await
    .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(
        &seen[0],
        ExecutionEvent::TaskStarted { task_id, attempt: 1 } if task_id.as_str() == "root"
    ));
    assert!(matches!(
        &seen[1],
        ExecutionEvent::TaskFailed { task_id, outcome: OutcomeCode::NonretryableFailure, .. }
            if task_id.as_str() == "root"
    ));
    assert!(matches!(
        &seen[2],
        ExecutionEvent::TaskFailed { task_id, error, .. }
            if task_id.as_str() == "leaf" && error.contains("root")
    ));
    assert_eq!(
        seen.last(),
        Some(&ExecutionEvent::RunFinished {
            status: OverallStatus::Failed
        })
    );
}
