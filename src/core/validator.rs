//! Structural validation of task plans.
//!
//! Runs before a [`TaskGraph`](crate::core::TaskGraph) is built. Structural
//! errors (duplicate IDs, dangling dependencies, cycles) are fatal and
//! reported together; warnings never affect validity.

use crate::core::graph::find_cycle;
use crate::core::plan::TaskPlan;
use crate::core::task::TaskId;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Warning thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Minimum number of isolated tasks before an orphan warning fires.
    pub orphan_threshold: usize,
    /// Estimates strictly above this many seconds are flagged.
    pub long_task_threshold_secs: u64,
    /// Descriptions with fewer characters than this are flagged.
    pub short_description_chars: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            orphan_threshold: 2,
            long_task_threshold_secs: 300,
            short_description_chars: 10,
        }
    }
}

/// Plan statistics, filled only for structurally valid plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanStats {
    pub total_tasks: usize,
    /// Tasks with no dependencies.
    pub parallelizable_tasks: usize,
    /// Longest dependency chain, counted in edges.
    pub max_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: PlanStats,
}

#[derive(Debug, Clone, Default)]
pub struct PlanValidator {
    config: ValidationConfig,
}

impl PlanValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Full validation: every structural error, every warning, and stats.
    pub fn validate(&self, plan: &TaskPlan) -> ValidationReport {
        if plan.is_empty() {
            return ValidationReport {
                valid: true,
                warnings: vec!["plan is empty".to_string()],
                ..Default::default()
            };
        }

        let mut errors = Vec::new();
        if let Some(err) = duplicate_error(plan) {
            errors.push(err);
        }
        errors.extend(missing_dependency_errors(plan));
        let cycle = cycle_error(plan);
        let has_cycle = cycle.is_some();
        errors.extend(cycle);

        let warnings = self.warnings(plan, has_cycle);
        let valid = errors.is_empty();
        let stats = if valid { compute_stats(plan) } else { PlanStats::default() };

        tracing::debug!(
            plan_id = %plan.id,
            valid,
            errors = errors.len(),
            warnings = warnings.len(),
            "plan validated"
        );

        ValidationReport {
            valid,
            errors,
            warnings,
            stats,
        }
    }

    /// Validate, then record the dependency depth in the plan's metadata.
    /// An invalid plan is left untouched.
    pub fn validate_and_annotate(&self, plan: &mut TaskPlan) -> ValidationReport {
        let report = self.validate(plan);
        if report.valid {
            plan.refresh_metadata(report.stats.max_depth);
        }
        report
    }

    /// Stop at the first structural error and return only its message.
    ///
    /// The result is always the first entry of [`validate`](Self::validate)'s
    /// error list.
    pub fn quick_validate(&self, plan: &TaskPlan) -> Option<String> {
        if plan.is_empty() {
            return None;
        }
        duplicate_error(plan)
            .or_else(|| missing_dependency_errors(plan).into_iter().next())
            .or_else(|| cycle_error(plan))
    }

    fn warnings(&self, plan: &TaskPlan, has_cycle: bool) -> Vec<String> {
        let mut warnings = Vec::new();

        let roots = plan.tasks.iter().filter(|t| t.dependencies.is_empty()).count();
        if plan.len() >= 2 && roots == 0 && !has_cycle {
            warnings.push(
                "No task without dependencies; nothing can start in parallel".to_string(),
            );
        }

        let depended_on: HashSet<&TaskId> = plan
            .tasks
            .iter()
            .flat_map(|t| t.dependencies.iter())
            .collect();
        let orphans: Vec<&str> = plan
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty() && !depended_on.contains(&t.id))
            .map(|t| t.id.as_str())
            .collect();
        if orphans.len() >= self.config.orphan_threshold.max(1) {
            warnings.push(format!(
                "Found {} orphan tasks (no dependencies or dependents): {}",
                orphans.len(),
                orphans.join(", ")
            ));
        }

        for task in &plan.tasks {
            if let Some(secs) = task.estimated_duration_secs {
                if secs > self.config.long_task_threshold_secs {
                    warnings.push(format!(
                        "Task '{}' has a long estimated duration ({}s > {}s)",
                        task.id, secs, self.config.long_task_threshold_secs
                    ));
                }
            }
            if task.description.trim().chars().count() < self.config.short_description_chars {
                warnings.push(format!("Task '{}' has a very short description", task.id));
            }
        }

        warnings
    }
}

/// Validate with default thresholds.
pub fn validate(plan: &TaskPlan) -> ValidationReport {
    PlanValidator::default().validate(plan)
}

/// First structural error with default thresholds.
pub fn quick_validate(plan: &TaskPlan) -> Option<String> {
    PlanValidator::default().quick_validate(plan)
}

fn duplicate_error(plan: &TaskPlan) -> Option<String> {
    let mut seen = HashSet::new();
    let mut duplicates: Vec<&str> = Vec::new();
    for task in &plan.tasks {
        if !seen.insert(task.id.as_str()) && !duplicates.contains(&task.id.as_str()) {
            duplicates.push(task.id.as_str());
        }
    }
    if duplicates.is_empty() {
        None
    } else {
        Some(format!("Duplicate task IDs: {}", duplicates.join(", ")))
    }
}

fn missing_dependency_errors(plan: &TaskPlan) -> Vec<String> {
    let known: HashSet<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
    plan.tasks
        .iter()
        .flat_map(|task| {
            let known = &known;
            task.dependencies
                .iter()
                .filter(move |dep| !known.contains(dep.as_str()))
                .map(move |dep| {
                    format!("Task '{}' depends on missing task '{}'", task.id, dep)
                })
        })
        .collect()
}

fn cycle_error(plan: &TaskPlan) -> Option<String> {
    let mut adjacency: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
    for task in &plan.tasks {
        adjacency.entry(&task.id).or_default();
    }
    for task in &plan.tasks {
        let known: Vec<&TaskId> = task
            .dependencies
            .iter()
            .filter(|dep| adjacency.contains_key(dep))
            .collect();
        if let Some(edges) = adjacency.get_mut(&task.id) {
            edges.extend(known);
        }
    }

    let path = find_cycle(plan.tasks.iter().map(|t| &t.id), |id| {
        adjacency.get(id).cloned().unwrap_or_default()
    })?;
    let rendered: Vec<&str> = path.iter().map(|id| id.as_str()).collect();
    Some(format!("Cycle detected: {}", rendered.join(" -> ")))
}

/// Stats for a plan already known to be structurally valid.
fn compute_stats(plan: &TaskPlan) -> PlanStats {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for task in &plan.tasks {
        graph.add_node(task.id.as_str());
    }
    for task in &plan.tasks {
        for dep in &task.dependencies {
            graph.add_edge(dep.as_str(), task.id.as_str(), ());
        }
    }

    let max_depth = match toposort(&graph, None) {
        Ok(order) => {
            let mut depth: HashMap<&str, usize> = HashMap::new();
            for node in order {
                let here = depth.get(node).copied().unwrap_or(0);
                for next in graph.neighbors(node) {
                    let entry = depth.entry(next).or_insert(0);
                    *entry = (*entry).max(here + 1);
                }
            }
            depth.values().copied().max().unwrap_or(0)
        }
        Err(_) => 0,
    };

    PlanStats {
        total_tasks: plan.len(),
        parallelizable_tasks: plan
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .count(),
        max_depth,
    }
}
