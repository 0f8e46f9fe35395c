//! Task plans as produced by an upstream planner.
//!
//! A plan is immutable once validated; the executor builds its own mutable
//! [`TaskGraph`](crate::core::TaskGraph) from it.

use crate::core::task::TaskSpec;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Plan-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanMetadata {
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Longest dependency chain, in edges.
    #[serde(default)]
    pub max_depth: usize,
    /// Sum of every task's estimated duration, in seconds.
    #[serde(default)]
    pub total_estimated_secs: u64,
}

impl Default for PlanMetadata {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            max_depth: 0,
            total_estimated_secs: 0,
        }
    }
}

/// An ordered list of task specifications plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default = "generate_plan_id")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

fn generate_plan_id() -> String {
    format!("plan-{}", Uuid::new_v4())
}

impl TaskPlan {
    /// Create a plan with a generated id and the current timestamp.
    pub fn new(description: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        let mut plan = Self {
            id: generate_plan_id(),
            description: description.into(),
            tasks,
            metadata: PlanMetadata::default(),
        };
        plan.metadata.total_estimated_secs = plan.total_estimated_secs();
        plan
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn from_json(input: &str) -> Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_toml(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    /// Load a plan from disk, choosing the format by file extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let plan = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content)?,
            Some("toml") => Self::from_toml(&content)?,
            other => {
                return Err(Error::Validation(format!(
                    "unsupported plan format {:?} for {}",
                    other.unwrap_or(""),
                    path.display()
                )))
            }
        };
        tracing::debug!(
            plan_id = %plan.id,
            tasks = plan.tasks.len(),
            path = %path.display(),
            "plan loaded"
        );
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn total_estimated_secs(&self) -> u64 {
        self.tasks
            .iter()
            .filter_map(|t| t.estimated_duration_secs)
            .sum()
    }

    /// Copy validation stats into the metadata block.
    pub fn refresh_metadata(&mut self, max_depth: usize) {
        self.metadata.max_depth = max_depth;
        self.metadata.total_estimated_secs = self.total_estimated_secs();
    }
}
