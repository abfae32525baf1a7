//! Rheem error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RheemError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Plan sanity error: {0}")]
    PlanSanity(String),

    #[error("No viable execution plan: {0}")]
    NoViablePlan(String),

    #[error("Execution error in {task}: {message}")]
    Execution { task: String, message: String },

    #[error("Execution log I/O error: {0}")]
    LogIo(#[from] std::io::Error),

    #[error("Execution log format error: {0}")]
    LogFormat(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RheemError {
    /// Wrap a backend failure so that the failing task is visible to the user.
    pub fn execution(task: impl Into<String>, message: impl Into<String>) -> Self {
        RheemError::Execution {
            task: task.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RheemError>;
