use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0}")]
    Config(String),
    #[error("Todoist rejected the API token: {0}")]
    Auth(String),
    #[error("Todoist task not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Request(String),
    #[error("{0}")]
    Io(String),
}

impl SyncError {
    pub fn message(&self) -> String {
        self.to_string()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Request(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}
