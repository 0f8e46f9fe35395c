pub mod admission;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;

pub use admission::{AdmissionController, LimitBreakdown, LimitInput};
pub use config::{Config, Profile};
pub use error::{Error, Result};
pub use orchestration::{DagExecutor, ExecutionResult, ExecutorConfig, OverallStatus};
