//! Core domain models: tasks, plans, validation and the dependency graph.

pub mod graph;
pub mod plan;
pub mod task;
pub mod validator;
pub mod weights;

pub use graph::{CycleReport, StatusCounts, TaskGraph};
pub use plan::{PlanMetadata, TaskPlan};
pub use task::{Priority, TaskId, TaskNode, TaskSpec, TaskStatus};
pub use validator::{PlanStats, PlanValidator, ValidationConfig, ValidationReport};
pub use weights::compute_weights;
