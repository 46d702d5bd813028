use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Parse,
    Protocol,
    LivenessTimeout,
    Acknowledgement,
}

/// Failures the sync engine absorbs. None of them stop event processing; they are
/// recorded as [`ErrorRecord`]s and counters instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed message: {0}")]
    Parse(String),
    #[error("unrecognized event shape: {0}")]
    Protocol(String),
    #[error("no traffic for {0:?}")]
    LivenessTimeout(Duration),
    #[error("acknowledgement failed: {0}")]
    Acknowledgement(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport(_) => ErrorKind::Transport,
            SyncError::Parse(_) => ErrorKind::Parse,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::LivenessTimeout(_) => ErrorKind::LivenessTimeout,
            SyncError::Acknowledgement(_) => ErrorKind::Acknowledgement,
        }
    }

    pub fn record(&self, at: DateTime<Utc>) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
            at,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        SyncError::Parse(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}
