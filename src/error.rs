//! Error types for the nomad VM driver

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("scheduler request failed: {0}")]
    Rpc(#[from] reqwest::Error),

    #[error("scheduler: {0}")]
    Scheduler(String),

    #[error("scheduler: could not find a node with available resources")]
    SchedulingTimeout,

    #[error("scheduler: job never reached terminal state")]
    NeverTerminal,

    #[error("scheduler: could not resolve machine: {0}")]
    Resolution(String),

    #[error("scheduler: init job failed: {0}")]
    InitFailure(String),

    #[error("scheduler: could not complete destroy job: {0}")]
    DestroyTimeout(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error came from input validation rather than the scheduler.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn scheduler(msg: impl Into<String>) -> Self {
        Error::Scheduler(msg.into())
    }
}
