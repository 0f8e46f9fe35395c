//! Dependency mutation through the executor, before and during a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempo::core::{TaskId, TaskPlan, TaskStatus};
use tempo::orchestration::{OverallStatus, TaskContext, TaskFailure};
use tempo::Error;

use crate::fixtures::{
    chain_plan, diamond_plan, executor, independent_plan, init_tracing, task, Recorder,
};

fn deps(exec: &tempo::DagExecutor, id: &str) -> Vec<String> {
    exec.dependencies_of(id)
        .unwrap()
        .into_iter()
        .map(|d| d.to_string())
        .collect()
}

#[test]
fn test_self_dependency_rejected() {
    init_tracing();
    let exec = executor(&diamond_plan(), 2);

    let err = exec.add_dependency("b", "b").unwrap_err();

    assert!(matches!(err, Error::SelfDependency(_)));
    assert!(err.to_string().contains("depend on itself"));
    assert_eq!(deps(&exec, "b"), vec!["a"]);
}

#[test]
fn test_duplicate_and_unknown_rejected() {
    init_tracing();
    let exec = executor(&diamond_plan(), 2);

    assert!(matches!(
        exec.add_dependency("d", "b"),
        Err(Error::DuplicateDependency { .. })
    ));
    assert!(matches!(
        exec.add_dependency("d", "ghost"),
        Err(Error::TaskNotFound(_))
    ));
    assert!(matches!(
        exec.add_dependency("ghost", "a"),
        Err(Error::TaskNotFound(_))
    ));
    assert_eq!(deps(&exec, "d"), vec!["b", "c"]);
}

/// Test: Cycle rejection names the path
/// Given t0 -> t1 -> t2
/// When t0 is made to depend on t2
/// Then the error carries the full cycle and the graph is unchanged
#[test]
fn test_cycle_rejected_with_path() {
    init_tracing();
    let exec = executor(&chain_plan(3), 1);
    let before = exec.graph_snapshot().snapshot();

    let err = exec.add_dependency("t0", "t2").unwrap_err();

    match &err {
        Error::CycleDetected {
            task,
            depends_on,
            path,
        } => {
            assert_eq!(task, "t0");
            assert_eq!(depends_on, "t2");
            assert_eq!(path, &vec!["t0", "t2", "t1", "t0"]);
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
    assert!(err.to_string().contains("t0 -> t2 -> t1 -> t0"));
    assert_eq!(exec.graph_snapshot().snapshot(), before);
    assert!(!exec.detect_cycle().has_cycle);
}

#[test]
fn test_remove_missing_edge_is_not_an_error() {
    init_tracing();
    let exec = executor(&diamond_plan(), 2);

    assert!(!exec.remove_dependency("a", "d").unwrap());
    assert!(matches!(
        exec.remove_dependency("a", "ghost"),
        Err(Error::TaskNotFound(_))
    ));
}

#[test]
fn test_add_then_remove_restores_dependencies() {
    init_tracing();
    let exec = executor(&diamond_plan(), 2);
    let before = exec.graph_snapshot().snapshot();

    exec.add_dependency("c", "b").unwrap();
    assert_eq!(deps(&exec, "c"), vec!["a", "b"]);
    assert!(exec.remove_dependency("c", "b").unwrap());

    assert_eq!(deps(&exec, "c"), vec!["a"]);
    assert_eq!(exec.graph_snapshot().snapshot(), before);
}

#[test]
fn test_readiness_tracks_mutations() {
    init_tracing();
    let plan = TaskPlan::new("flat", vec![task("a", &[]), task("b", &[]), task("c", &[])]);
    let exec = executor(&plan, 3);

    exec.add_dependency("b", "a").unwrap();
    exec.add_dependency("c", "b").unwrap();
    assert_eq!(exec.ready_tasks(), vec![TaskId::from("a")]);
    assert_eq!(exec.status("c"), Some(TaskStatus::Pending));

    assert!(matches!(
        exec.add_dependency("a", "c"),
        Err(Error::CycleDetected { .. })
    ));
    exec.remove_dependency("c", "b").unwrap();
    assert_eq!(exec.ready_tasks(), vec![TaskId::from("a"), TaskId::from("c")]);
    assert!(!exec.detect_cycle().has_cycle);
}

/// Test: Dependencies added mid-run are honored
/// Given independent tasks a, c, b and one slot
/// When a's runner makes c depend on b
/// Then b finishes before c starts, despite plan order
#[tokio::test(start_paused = true)]
async fn test_dependency_added_mid_run() {
    init_tracing();
    let plan = TaskPlan::new("late", vec![task("a", &[]), task("c", &[]), task("b", &[])]);
    let exec = executor(&plan, 1);
    let recorder = Recorder::new();

    let handle = exec.clone();
    let rec = Arc::clone(&recorder);
    let result = exec
        .run(move |ctx: TaskContext| {
            let handle = handle.clone();
            let rec = Arc::clone(&rec);
            async move {
                rec.start(ctx.id.as_str());
                if ctx.id.as_str() == "a" {
                    handle.add_dependency("c", "b").unwrap();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                rec.finish(ctx.id.as_str());
                Ok::<_, TaskFailure>(serde_json::Value::Null)
            }
        })
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(recorder.started(), vec!["a", "b", "c"]);
    assert!(recorder.finished_before_start("b", "c"));
}

/// Test: Attaching to a failed task fails the dependent
/// Given a fails while b is pending on nothing
/// When a's runner makes b depend on a and then fails
/// Then b is failed as blocked instead of running
#[tokio::test]
async fn test_dependency_on_failed_task_blocks() {
    init_tracing();
    let plan = TaskPlan::new("doomed", vec![task("a", &[]), task("b", &[])]);
    let exec = executor(&plan, 1);

    let handle = exec.clone();
    let result = exec
        .run(move |ctx: TaskContext| {
            let handle = handle.clone();
            async move {
                if ctx.id.as_str() == "a" {
                    handle.add_dependency("b", "a").unwrap();
                    return Err(TaskFailure::msg("permission denied"));
                }
                Ok(serde_json::Value::Null)
            }
        })
        .await
        .unwrap();

    assert_eq!(result.overall_status, OverallStatus::Failed);
    assert_eq!(
        result.failed_task_ids,
        vec![TaskId::from("a"), TaskId::from("b")]
    );
    assert_eq!(result.attempts[&TaskId::from("b")], 0);
}

/// Test: Edges toggled from another thread never break a run
/// Given 400 independent tasks, one slot and a multi-threaded runtime
/// When an OS thread keeps adding and removing an edge between ready tasks
/// Then the run succeeds with every task completed and none left running
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edge_toggling_during_run() {
    init_tracing();
    let exec = executor(&independent_plan(400), 1);
    let stop = Arc::new(AtomicBool::new(false));

    let handle = exec.clone();
    let flag = Arc::clone(&stop);
    let toggler = std::thread::spawn(move || {
        while !flag.load(Ordering::SeqCst) {
            let ready = handle.ready_tasks();
            if let (Some(first), Some(last)) = (ready.first(), ready.last()) {
                if first != last && handle.add_dependency(first, last).is_ok() {
                    let _ = handle.remove_dependency(first, last);
                }
            }
            std::thread::yield_now();
        }
    });

    let result = exec
        .run(|_ctx: TaskContext| async move {
            tokio::task::yield_now().await;
            Ok::<_, TaskFailure>(serde_json::Value::Null)
        })
        .await;
    stop.store(true, Ordering::SeqCst);
    toggler.join().unwrap();

    let result = result.unwrap();
    assert!(result.is_success(), "failures: {:?}", result.failures);
    assert_eq!(result.completed_task_ids.len(), 400);
    let counts = exec.graph_snapshot().counts();
    assert_eq!(counts.running, 0);
    assert_eq!(counts.completed, 400);
    assert!(!exec.detect_cycle().has_cycle);
}
