//! Priority-based selection and preemption.
//!
//! The dominance table is static: `critical` may preempt `high` and below,
//! `high` may preempt `normal` and below, and nothing else preempts.
//! Preemption is opt-in; with it disabled priority still orders selection
//! among ready tasks but never interrupts a running one.

use crate::core::task::{Priority, TaskId};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Priorities that `priority` is allowed to preempt.
pub fn preemptible_by(priority: Priority) -> &'static [Priority] {
    match priority {
        Priority::Critical => &[
            Priority::High,
            Priority::Normal,
            Priority::Low,
            Priority::Background,
        ],
        Priority::High => &[Priority::Normal, Priority::Low, Priority::Background],
        Priority::Normal | Priority::Low | Priority::Background => &[],
    }
}

/// A ready task competing for a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: TaskId,
    pub priority: Priority,
}

/// A running task that might be interrupted.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningTask {
    pub id: TaskId,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreemptionPolicy {
    enabled: bool,
}

impl PreemptionPolicy {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a task at `incoming` priority may interrupt one at `running`.
    pub fn should_preempt(&self, running: Priority, incoming: Priority) -> bool {
        self.enabled && preemptible_by(incoming).contains(&running)
    }

    /// Pick up to `slots` candidates.
    ///
    /// Order is priority first, then weight (higher first), then the order
    /// the candidates were given in.
    pub fn select(
        &self,
        candidates: &[Candidate],
        slots: usize,
        weights: &HashMap<TaskId, f64>,
    ) -> Vec<TaskId> {
        let mut ranked: Vec<(usize, &Candidate)> = candidates.iter().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then_with(|| {
                    let wa = weights.get(&a.id).copied().unwrap_or(0.0);
                    let wb = weights.get(&b.id).copied().unwrap_or(0.0);
                    wb.partial_cmp(&wa).unwrap_or(Ordering::Equal)
                })
                .then_with(|| ia.cmp(ib))
        });
        ranked
            .into_iter()
            .take(slots)
            .map(|(_, c)| c.id.clone())
            .collect()
    }

    /// The running task `incoming` should displace, if any.
    ///
    /// Picks the lowest-priority running task it dominates; among equals the
    /// most recently listed one, so long-running work is disturbed last.
    pub fn find_victim<'a>(
        &self,
        running: &'a [RunningTask],
        incoming: Priority,
    ) -> Option<&'a RunningTask> {
        if !self.enabled {
            return None;
        }
        running
            .iter()
            .enumerate()
            .filter(|(_, r)| self.should_preempt(r.priority, incoming))
            .min_by(|(ia, a), (ib, b)| {
                a.priority
                    .rank()
                    .cmp(&b.priority.rank())
                    .then_with(|| ib.cmp(ia))
            })
            .map(|(_, r)| r)
    }
}
