//! Property tests for graph mutation, validation and retry arithmetic,
//! plus the fixed reference cases they generalize.

use std::collections::HashSet;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use tempo::core::{validator, TaskGraph, TaskPlan, TaskSpec};
use tempo::orchestration::{
    resolve_aggregate_outcome, BackoffConfig, EntityOutcome, JitterMode,
};
use tempo::Error;

use crate::fixtures::{chain_plan, diamond_plan, task};

// Acyclic by construction: task i may only depend on tasks 0..i.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = TaskPlan> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..n), n).prop_map(
            move |raw| {
                let tasks = raw
                    .into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let deps: HashSet<String> = if i == 0 {
                            HashSet::new()
                        } else {
                            picks.into_iter().map(|p| format!("n{}", p % i)).collect()
                        };
                        let mut deps: Vec<String> = deps.into_iter().collect();
                        deps.sort();
                        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                        task(&format!("n{}", i), &deps)
                    })
                    .collect();
                TaskPlan::new("generated", tasks)
            },
        )
    })
}

#[derive(Debug, Clone)]
enum Op {
    Add(usize, usize),
    Remove(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..10usize, 0..10usize).prop_map(|(a, b)| Op::Add(a, b)),
        (0..10usize, 0..10usize).prop_map(|(a, b)| Op::Remove(a, b)),
    ]
}

/// Every edge in the graph, in a comparable form.
fn edges(graph: &TaskGraph) -> Vec<(String, Vec<String>)> {
    graph
        .nodes()
        .map(|n| {
            let deps = graph
                .dependencies_of(&n.id)
                .map(|d| d.iter().map(|id| id.to_string()).collect())
                .unwrap_or_default();
            (n.id.to_string(), deps)
        })
        .collect()
}

fn outcome_strategy() -> impl Strategy<Value = EntityOutcome> {
    prop_oneof![
        Just(EntityOutcome::Succeeded),
        any::<bool>().prop_map(|retryable| EntityOutcome::Failed { retryable }),
    ]
}

proptest! {
    #[test]
    fn test_generated_dags_validate(plan in dag_strategy(12)) {
        let report = validator::validate(&plan);
        prop_assert!(report.valid, "errors: {:?}", report.errors);
        prop_assert_eq!(report.stats.total_tasks, plan.len());

        let graph = TaskGraph::from_plan(&plan).unwrap();
        let order = graph.topological_order().unwrap();
        let position = |id: &str| order.iter().position(|o| o.as_str() == id).unwrap();
        for spec in &plan.tasks {
            for dep in &spec.dependencies {
                prop_assert!(position(dep.as_str()) < position(spec.id.as_str()));
            }
        }
    }

    #[test]
    fn test_reverse_edge_is_always_rejected(
        plan in dag_strategy(10),
        a in 0..10usize,
        b in 0..10usize,
    ) {
        let n = plan.len();
        let (a, b) = (format!("n{}", a % n), format!("n{}", b % n));
        prop_assume!(a != b);
        let mut graph = TaskGraph::from_plan(&plan).unwrap();
        prop_assume!(graph.add_edge(&a, &b).is_ok());

        let before = edges(&graph);
        let err = graph.add_edge(&b, &a).unwrap_err();
        prop_assert!(
            matches!(err, Error::CycleDetected { .. }),
            "unexpected error: {}",
            err
        );
        prop_assert_eq!(edges(&graph), before);
    }

    #[test]
    fn test_mutations_never_create_cycles(
        plan in dag_strategy(10),
        ops in proptest::collection::vec(op_strategy(), 0..40),
    ) {
        let n = plan.len();
        let mut graph = TaskGraph::from_plan(&plan).unwrap();
        for op in ops {
            let before = edges(&graph);
            let name = |i: usize| format!("n{}", i % n);
            let result = match op {
                Op::Add(a, b) => graph.add_edge(&name(a), &name(b)).map(|_| ()),
                Op::Remove(a, b) => graph.remove_edge(&name(a), &name(b)).map(|_| ()),
            };
            if result.is_err() {
                prop_assert_eq!(edges(&graph), before);
            }
            prop_assert!(!graph.detect_cycle().has_cycle);
            prop_assert!(graph.topological_order().is_ok());
        }
    }

    #[test]
    fn test_add_then_remove_round_trips(
        plan in dag_strategy(10),
        a in 0..10usize,
        b in 0..10usize,
    ) {
        let n = plan.len();
        let (a, b) = (format!("n{}", a % n), format!("n{}", b % n));
        let mut graph = TaskGraph::from_plan(&plan).unwrap();
        let before = edges(&graph);
        let statuses = graph.snapshot();

        if graph.add_edge(&a, &b).is_ok() {
            prop_assert!(graph.remove_edge(&a, &b).unwrap());
        }
        prop_assert_eq!(edges(&graph), before);
        prop_assert_eq!(graph.snapshot(), statuses);
    }

    #[test]
    fn test_success_never_lowers_aggregate(
        batch in proptest::collection::vec(outcome_strategy(), 0..20),
        index in any::<prop::sample::Index>(),
    ) {
        let base = resolve_aggregate_outcome(&batch).success_rank();

        let mut appended = batch.clone();
        appended.push(EntityOutcome::Succeeded);
        prop_assert!(resolve_aggregate_outcome(&appended).success_rank() >= base);

        if !batch.is_empty() {
            let mut replaced = batch.clone();
            replaced[index.index(batch.len())] = EntityOutcome::Succeeded;
            prop_assert!(resolve_aggregate_outcome(&replaced).success_rank() >= base);
        }
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped(
        initial in 1..10_000u64,
        multiplier in 1.0..4.0f64,
        max in 1..120_000u64,
    ) {
        let backoff = BackoffConfig {
            initial_delay_ms: initial,
            multiplier,
            max_delay_ms: max,
            jitter: JitterMode::None,
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = backoff.base_delay(attempt);
            prop_assert!(delay >= previous);
            prop_assert!(delay <= Duration::from_millis(max));
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds(seed in any::<u64>(), attempt in 1..10u32) {
        let mut rng = StdRng::seed_from_u64(seed);
        let partial = BackoffConfig { jitter: JitterMode::Partial, ..Default::default() };
        let full = BackoffConfig { jitter: JitterMode::Full, ..Default::default() };
        let base = partial.base_delay(attempt);

        let p = partial.delay_with(attempt, &mut rng);
        prop_assert!(p >= base / 2 && p <= base);
        prop_assert!(full.delay_with(attempt, &mut rng) <= base);
    }
}

// Fixed reference cases

#[test]
fn test_diamond_stats() {
    let report = validator::validate(&diamond_plan());
    assert!(report.valid);
    assert_eq!(report.stats.total_tasks, 4);
    assert_eq!(report.stats.parallelizable_tasks, 1);
    assert_eq!(report.stats.max_depth, 2);
}

#[test]
fn test_chain_stats() {
    let report = validator::validate(&chain_plan(10));
    assert!(report.valid);
    assert_eq!(report.stats.max_depth, 9);
    assert_eq!(report.stats.parallelizable_tasks, 1);
}

#[test]
fn test_empty_plan_is_valid_with_single_warning() {
    let report = validator::validate(&TaskPlan::new("nothing", vec![]));
    assert!(report.valid);
    assert!(report.errors.is_empty());
    assert_eq!(report.warnings, vec!["plan is empty".to_string()]);
}

#[test]
fn test_two_task_cycle_is_reported() {
    let plan = TaskPlan::new(
        "loop",
        vec![
            TaskSpec::new("a", "first half of the loop").depends_on(["b"]),
            TaskSpec::new("b", "second half of the loop").depends_on(["a"]),
        ],
    );
    let report = validator::validate(&plan);
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.contains("ycle")));
    assert!(matches!(TaskGraph::from_plan(&plan), Err(Error::InvalidPlan(_))));
}

#[test]
fn test_reference_backoff_schedule() {
    let backoff = BackoffConfig::default();
    let delays: Vec<u64> = (1..=4).map(|a| backoff.base_delay(a).as_millis() as u64).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    assert_eq!(backoff.base_delay(10), Duration::from_millis(30_000));
}
