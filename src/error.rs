use thiserror::Error;

use crate::state_machine::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// A status-guarded update matched no row: the job was not in the expected state.
    #[error("Job {job_id} is {actual}, expected {expected}")]
    StatusConflict {
        job_id: JobId,
        expected: String,
        actual: JobStatus,
    },

    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("No open suspension ticket for job {0}")]
    NoOpenTicket(JobId),

    #[error("Suspension ticket for job {0} has expired")]
    TicketExpired(JobId),

    #[error("Job {0} already has an open suspension ticket")]
    TicketAlreadyOpen(JobId),

    #[error("Invalid stored value: {0}")]
    InvalidStoredValue(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl EngineError {
    /// Store failures mean a transition may not have been persisted; nothing
    /// downstream can trust the job table after one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::InvalidStoredValue(_))
    }
}
