use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid plan: {}", .0.join("; "))]
    InvalidPlan(Vec<String>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Task '{task}' already depends on '{depends_on}'")]
    DuplicateDependency { task: String, depends_on: String },

    #[error(
        "Adding dependency {task} -> {depends_on} would create a cycle: {}",
        .path.join(" -> ")
    )]
    CycleDetected {
        task: String,
        depends_on: String,
        path: Vec<String>,
    },

    #[error("Timed out after {0:?} waiting for admission")]
    QueueTimeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, Error>;
