//! Typed error hierarchy for the sync engine.
//!
//! `SyncError` covers the failures engine callers branch on: missing rows,
//! inactive servers, and forge API responses. Storage code keeps using
//! `anyhow` with context and is wrapped at the engine boundary.

use thiserror::Error;

/// Errors raised by import, export and hook management.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Server {id} not found")]
    ServerNotFound { id: i64 },

    #[error("Repo {id} not found")]
    RepoNotFound { id: i64 },

    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Story {id} not found in project {project_id}")]
    StoryNotFound { project_id: i64, id: i64 },

    #[error("Task {id} not found in project {project_id}")]
    TaskNotFound { project_id: i64, id: i64 },

    #[error("Server {id} is deleted, disabled or has no access token")]
    ServerInactive { id: i64 },

    #[error("Repo {repo_id} has no link to server {server_id}")]
    MissingLink { repo_id: i64, server_id: i64 },

    #[error("Task {task_id} cannot be exported: {reason}")]
    NotExportable { task_id: i64, reason: String },

    #[error("Forge API returned {status}: {message}")]
    Forge { status: u16, message: String },

    #[error("Forge request failed: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether another attempt could plausibly succeed: network failures,
    /// rate limiting and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Transport(_) => true,
            SyncError::Forge { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SyncError::Forge {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => SyncError::Transport(err.to_string()),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
