//! Admission control as seen by a run: layered limits, adaptive pressure
//! and rate-limited dispatch.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tempo::admission::{
    AdaptiveConfig, AdmissionController, LimitInput, ObservationKind, PresetSource, PresetTable,
    StaticSnapshot, SystemSnapshot,
};
use tempo::core::TaskId;
use tempo::orchestration::{
    BackoffConfig, DagExecutor, ExecutorConfig, RetryPolicy, TaskContext, TaskFailure,
};

use crate::fixtures::{
    admission, admission_with, executor, executor_config, independent_plan, init_tracing, preset,
    task, Recorder, MODEL, PROVIDER,
};

fn with_snapshot(snapshot: SystemSnapshot) -> AdmissionController {
    AdmissionController::default().with_snapshot_provider(Arc::new(StaticSnapshot(snapshot)))
}

#[test]
fn test_breakdown_reports_every_layer() {
    init_tracing();
    let controller = with_snapshot(SystemSnapshot {
        hard_limit: None,
        active_instances: Some(2),
        scheduling_adjustment: Some(0.5),
    });

    let breakdown = controller.effective_limit(&LimitInput::new("openai", "gpt-4o"));

    assert_eq!(breakdown.key, "openai::gpt-4o");
    assert_eq!(breakdown.preset_limit, 8);
    assert_eq!(breakdown.preset_source, PresetSource::Provider);
    assert_eq!(breakdown.fair_share, 0.5);
    assert_eq!(breakdown.scheduling_adjustment, 0.5);
    // 8 * 0.5 * 1.5
    assert_eq!(breakdown.effective_limit, 6);
    assert!(breakdown.warnings.is_empty());
}

#[test]
fn test_hard_limit_caps_and_floor_is_one() {
    init_tracing();
    let capped = with_snapshot(SystemSnapshot {
        hard_limit: Some(3),
        active_instances: None,
        scheduling_adjustment: None,
    });
    assert_eq!(
        capped
            .effective_limit(&LimitInput::new("openai", "gpt-4o"))
            .effective_limit,
        3
    );

    let starved = with_snapshot(SystemSnapshot {
        hard_limit: None,
        active_instances: Some(100),
        scheduling_adjustment: Some(-1.0),
    });
    assert_eq!(
        starved
            .effective_limit(&LimitInput::new("openai", "gpt-4o"))
            .effective_limit,
        1
    );
}

#[test]
fn test_unknown_provider_uses_default_with_warning() {
    init_tracing();
    let breakdown =
        AdmissionController::default().effective_limit(&LimitInput::new("acme", "rocket"));

    assert_eq!(breakdown.preset_source, PresetSource::Default);
    assert!(breakdown.warnings.iter().any(|w| w.contains("no preset for acme::rocket")));
    assert!(breakdown.warnings.iter().any(|w| w.contains("no snapshot provider")));
}

/// Test: Pressure decays with the half-life
/// Given two rate-limit hits against a limit of 8
/// When time passes
/// Then the limit recovers: 4 now, 6 after one half-life, 7 after two
#[test]
fn test_penalty_decays_over_time() {
    init_tracing();
    let controller = AdmissionController::default();
    let input = LimitInput::new("openai", "gpt-4o");
    let t0 = Instant::now();
    for _ in 0..2 {
        controller.observe_at("openai", "gpt-4o", ObservationKind::RateLimit { wait_ms: 0 }, t0);
    }

    assert_eq!(controller.effective_limit_at(&input, t0).effective_limit, 4);
    assert_eq!(
        controller
            .effective_limit_at(&input, t0 + Duration::from_secs(60))
            .effective_limit,
        6
    );
    assert_eq!(
        controller
            .effective_limit_at(&input, t0 + Duration::from_secs(120))
            .effective_limit,
        7
    );
}

/// Test: A snapshot cap bounds run concurrency
/// Given 6 independent tasks, a preset of 4 and a hard limit of 2
/// When the plan runs
/// Then at most 2 run at once
#[tokio::test(start_paused = true)]
async fn test_hard_limit_bounds_run() {
    init_tracing();
    let controller = AdmissionController::new(
        PresetTable::new(vec![preset(4, 0)], 4),
        AdaptiveConfig::default(),
    )
    .with_snapshot_provider(Arc::new(StaticSnapshot(SystemSnapshot {
        hard_limit: Some(2),
        ..Default::default()
    })));
    let exec =
        DagExecutor::new(&independent_plan(6), executor_config(), Arc::new(controller)).unwrap();
    let recorder = Recorder::new();

    let result = exec.run(recorder.runner(Duration::from_millis(10))).await.unwrap();

    assert!(result.is_success());
    assert_eq!(recorder.peak(), 2);
}

/// Test: Rate limits space out dispatch
/// Given a bucket of one permit refilling at 60 per minute
/// When three independent tasks run
/// Then they all complete, one per second
#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_dispatch() {
    init_tracing();
    let mut entry = preset(3, 60);
    entry.burst = Some(1);
    let exec =
        DagExecutor::new(&independent_plan(3), executor_config(), admission_with(entry)).unwrap();
    let recorder = Recorder::new();
    let started = Instant::now();

    let result = exec.run(recorder.runner(Duration::from_millis(10))).await.unwrap();

    assert_eq!(result.completed_task_ids.len(), 3);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(recorder.peak(), 1);
}

/// Test: Failures feed the adaptive layer
/// Given a task rate limited twice before succeeding
/// When the plan runs
/// Then the controller has recorded the pressure and lowered the limit
#[tokio::test(start_paused = true)]
async fn test_rate_limited_failures_lower_limit() {
    init_tracing();
    let controller = admission(4);
    let plan = tempo::core::TaskPlan::new("pressure", vec![task("call", &[])]);
    let config = ExecutorConfig {
        retry: RetryPolicy {
            max_retries: 3,
            backoff: BackoffConfig::default(),
        },
        ..executor_config()
    };
    let exec = DagExecutor::new(&plan, config, Arc::clone(&controller)).unwrap();

    let result = exec
        .run(|ctx: TaskContext| async move {
            if ctx.attempt <= 2 {
                Err(TaskFailure::RateLimited { retry_after_ms: None })
            } else {
                Ok(serde_json::Value::Null)
            }
        })
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.attempts[&TaskId::from("call")], 3);
    let snapshot = controller.adaptive_snapshot(PROVIDER, MODEL);
    assert_eq!(snapshot.rate_limits, 2);
    assert_eq!(snapshot.successes, 1);
    assert!(exec.effective_limit().effective_limit < 4);
}

#[tokio::test]
async fn test_executor_reports_its_limit() {
    init_tracing();
    let exec = executor(&independent_plan(1), 5);
    let breakdown = exec.effective_limit();
    assert_eq!(breakdown.key, format!("{}::{}", PROVIDER, MODEL));
    assert_eq!(breakdown.effective_limit, 5);
}
