//! Derived scheduling weights.
//!
//! A weight is a non-authoritative hint computed from the current graph:
//! tasks that unblock more downstream work, or sit at the head of a longer
//! chain, score higher. The executor keeps weights in a side map and only
//! uses them to break ties between equal priorities.

use crate::core::graph::TaskGraph;
use crate::core::task::TaskId;
use crate::error::Result;
use std::collections::{BTreeSet, HashMap};

const FAN_OUT_WEIGHT: f64 = 1.0;
const DEPTH_WEIGHT: f64 = 0.5;
const PRIORITY_WEIGHT: f64 = 0.25;

/// Compute a weight for every task in the graph.
///
/// `weight = 1 + fan_out + 0.5 * depth + 0.25 * priority_rank`, where
/// `fan_out` counts transitive dependents and `depth` is the longest chain
/// of dependents below the task.
///
/// # Errors
/// Fails if the graph contains a cycle.
pub fn compute_weights(graph: &TaskGraph) -> Result<HashMap<TaskId, f64>> {
    let order = graph.topological_order()?;

    // Walk in reverse topological order so every dependent is final before
    // the tasks it waits on are visited.
    let mut downstream: HashMap<&TaskId, BTreeSet<&TaskId>> = HashMap::new();
    let mut depth: HashMap<&TaskId, usize> = HashMap::new();
    for id in order.iter().rev() {
        let mut reach = BTreeSet::new();
        let mut longest = 0;
        for dependent in graph.dependents_of(id).into_iter().flatten() {
            reach.insert(dependent);
            if let Some(below) = downstream.get(dependent) {
                reach.extend(below.iter().copied());
            }
            longest = longest.max(depth.get(dependent).copied().unwrap_or(0) + 1);
        }
        downstream.insert(id, reach);
        depth.insert(id, longest);
    }

    let weights = order
        .iter()
        .map(|id| {
            let fan_out = downstream.get(id).map_or(0, BTreeSet::len) as f64;
            let chain = depth.get(id).copied().unwrap_or(0) as f64;
            let rank = graph.node(id).map_or(0, |n| n.priority.rank()) as f64;
            let weight =
                1.0 + FAN_OUT_WEIGHT * fan_out + DEPTH_WEIGHT * chain + PRIORITY_WEIGHT * rank;
            (id.clone(), weight)
        })
        .collect();
    Ok(weights)
}
