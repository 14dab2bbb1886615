//! Error types shared by the storage seam and the rollup job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure of a single object-store call.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage backend error on '{key}': {message}")]
    Backend { key: String, message: String },

    #[error("{op} on '{key}' timed out after {after:?}")]
    Timeout {
        op: &'static str,
        key: String,
        after: Duration,
    },
}

impl StoreError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }

    pub fn backend(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Terminal failures of a rollup invocation.
///
/// Recoverable problems (one unreadable snapshot, one malformed key) never
/// surface here; they are reported as skipped units instead.
#[derive(Error, Debug)]
pub enum RollupError {
    #[error("upstream unavailable while reading {what}: {source}")]
    Upstream {
        what: String,
        #[source]
        source: StoreError,
    },

    #[error("reference table '{key}' is missing")]
    MissingReference { key: String },

    #[error("reference table '{key}' is malformed: {reason}")]
    MalformedReference { key: String, reason: String },

    #[error("failed to persist '{key}': {source}")]
    Persistence {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("rollup lock '{key}' is held since {since}")]
    LockHeld { key: String, since: DateTime<Utc> },

    #[error("rollup lock '{key}' was taken over by another run")]
    LockLost { key: String },

    #[error("failed to encode '{key}': {reason}")]
    Encode { key: String, reason: String },

    #[error("snapshot loader task failed: {0}")]
    Task(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RollupError>;

impl RollupError {
    pub fn upstream(what: impl Into<String>, source: StoreError) -> Self {
        Self::Upstream {
            what: what.into(),
            source,
        }
    }

    pub fn persistence(key: impl Into<String>, source: StoreError) -> Self {
        Self::Persistence {
            key: key.into(),
            source,
        }
    }

    pub fn malformed(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedReference {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn encode(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Encode {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the failure came from a store call that ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RollupError::Upstream {
                source: StoreError::Timeout { .. },
                ..
            } | RollupError::Persistence {
                source: StoreError::Timeout { .. },
                ..
            }
        )
    }
}
