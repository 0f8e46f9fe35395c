//! Task graph for dependency management.
//!
//! The graph is an arena keyed by [`TaskId`]. Each entry owns its node plus
//! two ID sets: `dependencies` (what the task waits on) and `dependents`
//! (who waits on it). The dependents set is a back-reference used only for
//! readiness propagation. Edges are identifiers, never references, so a
//! mutation can be fully checked before anything is written.
//!
//! Invariant: `b ∈ a.dependencies ⇔ a ∈ b.dependents`, and the dependency
//! relation is acyclic.

use crate::core::plan::TaskPlan;
use crate::core::task::{TaskId, TaskNode, TaskStatus};
use crate::core::validator;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Result of an on-demand cycle check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CycleReport {
    pub has_cycle: bool,
    /// Offending path following dependency edges, first node repeated at
    /// the end. Empty when there is no cycle.
    pub cycle_path: Vec<TaskId>,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    node: TaskNode,
    dependencies: BTreeSet<TaskId>,
    dependents: BTreeSet<TaskId>,
}

/// The task dependency graph for one execution run.
///
/// The node set is fixed at construction; edges may change while a run is
/// in progress through [`add_edge`](Self::add_edge) and
/// [`remove_edge`](Self::remove_edge).
#[derive(Clone)]
pub struct TaskGraph {
    entries: HashMap<TaskId, Entry>,
    /// Plan order, used wherever iteration order is observable.
    order: Vec<TaskId>,
}

impl TaskGraph {
    /// Build a graph from a plan, rejecting structurally invalid plans.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPlan`] carrying every structural error the
    /// validator found.
    pub fn from_plan(plan: &TaskPlan) -> Result<Self> {
        let report = validator::validate(plan);
        if !report.valid {
            return Err(Error::InvalidPlan(report.errors));
        }

        let mut entries = HashMap::with_capacity(plan.tasks.len());
        let mut order = Vec::with_capacity(plan.tasks.len());
        for spec in &plan.tasks {
            order.push(spec.id.clone());
            entries.insert(
                spec.id.clone(),
                Entry {
                    node: TaskNode::from_spec(spec),
                    dependencies: spec.dependencies.iter().cloned().collect(),
                    dependents: BTreeSet::new(),
                },
            );
        }
        for spec in &plan.tasks {
            for dep in &spec.dependencies {
                if let Some(entry) = entries.get_mut(dep) {
                    entry.dependents.insert(spec.id.clone());
                }
            }
        }

        let mut graph = Self { entries, order };
        let ids = graph.order.clone();
        for id in &ids {
            graph.refresh_readiness(id);
        }
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Task identifiers in plan order.
    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.order.iter()
    }

    /// Nodes in plan order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| &e.node))
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.entries.get(id).map(|e| &e.node)
    }

    pub fn status(&self, id: &str) -> Option<&TaskStatus> {
        self.node(id).map(|n| &n.status)
    }

    pub fn dependencies_of(&self, id: &str) -> Option<&BTreeSet<TaskId>> {
        self.entries.get(id).map(|e| &e.dependencies)
    }

    pub fn dependents_of(&self, id: &str) -> Option<&BTreeSet<TaskId>> {
        self.entries.get(id).map(|e| &e.dependents)
    }

    pub fn has_dependency(&self, task: &str, depends_on: &str) -> bool {
        self.entries
            .get(task)
            .is_some_and(|e| e.dependencies.contains(depends_on))
    }

    pub fn edge_count(&self) -> usize {
        self.entries.values().map(|e| e.dependencies.len()).sum()
    }

    // ========== Queries ==========

    /// Ready tasks in plan order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| matches!(self.status(id), Some(TaskStatus::Ready)))
            .cloned()
            .collect()
    }

    pub fn running_tasks(&self) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| matches!(self.status(id), Some(TaskStatus::Running)))
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.entries.values() {
            match entry.node.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.entries.values().all(|e| e.node.status.is_terminal())
    }

    /// Status of every task in plan order.
    pub fn snapshot(&self) -> Vec<(TaskId, TaskStatus)> {
        self.nodes()
            .map(|n| (n.id.clone(), n.status.clone()))
            .collect()
    }

    /// Path `from -> ... -> to` following dependency edges, if one exists.
    pub fn path_between(&self, from: &str, to: &str) -> Option<Vec<TaskId>> {
        let (start, _) = self.entries.get_key_value(from)?;
        if from == to {
            return Some(vec![start.clone()]);
        }

        let mut parent: HashMap<&TaskId, &TaskId> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            let Some(entry) = self.entries.get(current) else {
                continue;
            };
            for next in &entry.dependencies {
                if next == start || parent.contains_key(next) {
                    continue;
                }
                parent.insert(next, current);
                if next.as_str() == to {
                    let mut path = vec![next.clone()];
                    let mut cursor = next;
                    while let Some(prev) = parent.get(cursor) {
                        path.push((*prev).clone());
                        cursor = *prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Whether `to` can be reached from `from` following dependency edges.
    pub fn is_reachable(&self, from: &str, to: &str) -> bool {
        self.path_between(from, to).is_some()
    }

    /// Full-graph cycle check.
    pub fn detect_cycle(&self) -> CycleReport {
        let path = find_cycle(self.order.iter(), |id| {
            self.entries
                .get(id)
                .map(|e| e.dependencies.iter().collect())
                .unwrap_or_default()
        });
        match path {
            Some(cycle_path) => CycleReport {
                has_cycle: true,
                cycle_path,
            },
            None => CycleReport::default(),
        }
    }

    /// Tasks ordered so that every task follows all of its dependencies.
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let mut graph: DiGraphMap<&str, ()> =
            DiGraphMap::with_capacity(self.len(), self.edge_count());
        for id in &self.order {
            graph.add_node(id.as_str());
        }
        for id in &self.order {
            if let Some(entry) = self.entries.get(id) {
                for dep in &entry.dependencies {
                    graph.add_edge(dep.as_str(), id.as_str(), ());
                }
            }
        }
        let sorted = toposort(&graph, None).map_err(|cycle| {
            Error::Validation(format!("Cycle detected at task: {}", cycle.node_id()))
        })?;
        Ok(sorted.into_iter().map(TaskId::from).collect())
    }

    // ========== Edge Mutation ==========

    /// Check whether `task -> depends_on` may be inserted, without mutating.
    pub fn check_edge(&self, task: &str, depends_on: &str) -> Result<()> {
        self.require(task)?;
        self.require(depends_on)?;
        if task == depends_on {
            return Err(Error::SelfDependency(task.to_string()));
        }
        if self.has_dependency(task, depends_on) {
            return Err(Error::DuplicateDependency {
                task: task.to_string(),
                depends_on: depends_on.to_string(),
            });
        }
        if let Some(back) = self.path_between(depends_on, task) {
            let mut path = vec![TaskId::from(task)];
            path.extend(back);
            return Err(Error::CycleDetected {
                task: task.to_string(),
                depends_on: depends_on.to_string(),
                path: path.into_iter().map(|id| id.0).collect(),
            });
        }
        Ok(())
    }

    /// Make `task` depend on `depends_on`.
    ///
    /// All checks run before anything is written, so a rejected call leaves
    /// the graph untouched. A ready task that gains an unfinished dependency
    /// drops back to pending; running and terminal tasks keep their status.
    pub fn add_edge(&mut self, task: &str, depends_on: &str) -> Result<()> {
        self.check_edge(task, depends_on)?;

        if let Some(entry) = self.entries.get_mut(task) {
            entry.dependencies.insert(TaskId::from(depends_on));
        }
        if let Some(entry) = self.entries.get_mut(depends_on) {
            entry.dependents.insert(TaskId::from(task));
        }
        self.refresh_readiness(task);
        Ok(())
    }

    /// Remove `task -> depends_on`. Returns whether the edge existed.
    ///
    /// # Errors
    /// Fails only when either identifier is unknown.
    pub fn remove_edge(&mut self, task: &str, depends_on: &str) -> Result<bool> {
        self.require(task)?;
        self.require(depends_on)?;
        if !self.has_dependency(task, depends_on) {
            return Ok(false);
        }

        if let Some(entry) = self.entries.get_mut(task) {
            entry.dependencies.remove(depends_on);
        }
        if let Some(entry) = self.entries.get_mut(depends_on) {
            entry.dependents.remove(task);
        }
        self.refresh_readiness(task);
        Ok(true)
    }

    // ========== Status Transitions ==========

    /// Move a ready task to running.
    pub fn mark_running(&mut self, id: &str) -> Result<()> {
        let node = self.node_mut(id)?;
        if node.status != TaskStatus::Ready {
            return Err(Error::Validation(format!(
                "Task {} cannot start from status {}",
                id,
                node.status.label()
            )));
        }
        node.start();
        Ok(())
    }

    /// Mark a task completed and return the dependents that became ready.
    ///
    /// Propagation happens in the same call, so no dependent is observed
    /// pending after its last blocker completed.
    pub fn mark_completed(&mut self, id: &str) -> Result<Vec<TaskId>> {
        let node = self.node_mut(id)?;
        node.attempts += 1;
        node.complete();

        let dependents: Vec<TaskId> = self
            .entries
            .get(id)
            .map(|e| e.dependents.iter().cloned().collect())
            .unwrap_or_default();
        let mut newly_ready = Vec::new();
        for dependent in dependents {
            if self.refresh_readiness(&dependent) {
                newly_ready.push(dependent);
            }
        }
        tracing::debug!(task = %id, newly_ready = newly_ready.len(), "readiness propagated");
        Ok(newly_ready)
    }

    /// Mark a task permanently failed and fail everything blocked behind it.
    ///
    /// Returns the dependents that were failed as a consequence.
    pub fn mark_failed(&mut self, id: &str, error: &str) -> Result<Vec<TaskId>> {
        let node = self.node_mut(id)?;
        node.attempts += 1;
        node.fail(error);
        Ok(self.propagate_failures())
    }

    /// Return a running task to the ready queue.
    ///
    /// `count_attempt` is false for preempted runs. A task whose
    /// dependencies changed while it ran goes back to pending instead.
    pub fn requeue(&mut self, id: &str, count_attempt: bool) -> Result<()> {
        let node = self.node_mut(id)?;
        if count_attempt {
            node.attempts += 1;
        }
        node.mark_pending();
        node.started_at = None;
        self.refresh_readiness(id);
        Ok(())
    }

    /// Fail every not-yet-started task that waits on a failed task,
    /// transitively. Returns the tasks failed by this call.
    pub fn propagate_failures(&mut self) -> Vec<TaskId> {
        let mut blocked = Vec::new();
        loop {
            let next: Vec<(TaskId, TaskId)> = self
                .order
                .iter()
                .filter_map(|id| {
                    let entry = self.entries.get(id)?;
                    if !matches!(entry.node.status, TaskStatus::Pending | TaskStatus::Ready) {
                        return None;
                    }
                    entry
                        .dependencies
                        .iter()
                        .find(|dep| self.status(dep).is_some_and(TaskStatus::is_failed))
                        .map(|dep| (id.clone(), dep.clone()))
                })
                .collect();
            if next.is_empty() {
                break;
            }
            for (id, dep) in next {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry
                        .node
                        .fail(&format!("blocked by failed dependency '{}'", dep));
                    blocked.push(id);
                }
            }
        }
        blocked
    }

    // ========== Internals ==========

    fn require(&self, id: &str) -> Result<()> {
        if self.entries.contains_key(id) {
            Ok(())
        } else {
            Err(Error::TaskNotFound(id.to_string()))
        }
    }

    fn node_mut(&mut self, id: &str) -> Result<&mut TaskNode> {
        self.entries
            .get_mut(id)
            .map(|e| &mut e.node)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    fn deps_satisfied(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|e| {
            e.dependencies
                .iter()
                .all(|dep| matches!(self.status(dep), Some(TaskStatus::Completed)))
        })
    }

    /// Re-derive `pending ⇄ ready` for one task. Returns true when the task
    /// moved from pending to ready.
    fn refresh_readiness(&mut self, id: &str) -> bool {
        let satisfied = self.deps_satisfied(id);
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        match (&entry.node.status, satisfied) {
            (TaskStatus::Pending, true) => {
                entry.node.mark_ready();
                true
            }
            (TaskStatus::Ready, false) => {
                entry.node.mark_pending();
                false
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.edge_count())
            .finish()
    }
}

/// Depth-first cycle search tracking the recursion stack.
///
/// `deps` yields the outgoing dependency edges of a node. Returns the first
/// cycle found, with the entry node repeated at the end.
pub(crate) fn find_cycle<'a, I, F>(roots: I, deps: F) -> Option<Vec<TaskId>>
where
    I: IntoIterator<Item = &'a TaskId>,
    F: Fn(&'a TaskId) -> Vec<&'a TaskId>,
{
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        OnStack,
        Done,
    }

    let mut marks: HashMap<&'a TaskId, Mark> = HashMap::new();
    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        marks.insert(root, Mark::OnStack);
        let mut stack: Vec<(&'a TaskId, std::vec::IntoIter<&'a TaskId>)> =
            vec![(root, deps(root).into_iter())];

        loop {
            let next = match stack.last_mut() {
                Some((_, children)) => children.next(),
                None => break,
            };
            match next {
                Some(child) => match marks.get(child).copied() {
                    Some(Mark::OnStack) => {
                        let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                        let mut path: Vec<TaskId> =
                            stack[start..].iter().map(|(n, _)| (*n).clone()).collect();
                        path.push(child.clone());
                        return Some(path);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(child, Mark::OnStack);
                        stack.push((child, deps(child).into_iter()));
                    }
                },
                None => {
                    if let Some((done, _)) = stack.pop() {
                        marks.insert(done, Mark::Done);
                    }
                }
            }
        }
    }
    None
}
