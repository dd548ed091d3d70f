//! Typed errors for the seams where callers branch on failure kind.
//!
//! Everything else in the crate returns `anyhow::Result`.

use thiserror::Error;

/// Failure fetching a remote collection's objects.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("collection url is required")]
    MissingUrl,

    #[error("collection fetch failed with status {0}")]
    Status(u16),

    #[error("collection request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("collection payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SyncError {
    /// Transport and status failures are worth retrying on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Status(_) | SyncError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("generation job not found: {0}")]
    UnknownJob(String),

    #[error("generation phase not found: {0}")]
    UnknownPhase(String),

    #[error("job {job_id} is already {status}")]
    AlreadyFinished { job_id: String, status: String },

    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}
