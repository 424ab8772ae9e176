//! Error types for the job subsystem.

use thiserror::Error;

use caseflow_core::{DomainError, SourceError};

use crate::types::QueueName;

/// Durable store error (job store, lease store, dead-letter store, ...).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// Enqueue / bookkeeping error surfaced to callers of a queue.
///
/// Store failures propagate; work is never silently dropped.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid {job} payload: {source}")]
    InvalidPayload {
        job: &'static str,
        #[source]
        source: DomainError,
    },
    #[error("job {job} belongs to queue {expected}, not {actual}")]
    WrongQueue {
        job: &'static str,
        expected: QueueName,
        actual: QueueName,
    },
    #[error("dead-letter capture failed: {0}")]
    DeadLetter(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    /// The job itself was refused before anything reached the store.
    pub fn is_rejection(&self) -> bool {
        matches!(self, QueueError::InvalidPayload { .. } | QueueError::WrongQueue { .. })
    }
}

/// Failure returned by a job handler.
///
/// Returning an error is the sole signal the framework needs to retry or
/// dead-letter the job.
#[derive(Debug, Error)]
pub enum JobError {
    /// Expected to heal (timeout, 429, upstream 5xx).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Will not heal by retrying (not found, rejected input).
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// The payload failed validation at dequeue.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[source] DomainError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the failure is classified as non-retriable.
    pub fn is_permanent(&self) -> bool {
        match self {
            JobError::Permanent(_) | JobError::InvalidPayload(_) => true,
            JobError::Source(e) => !e.is_transient(),
            JobError::Queue(QueueError::InvalidPayload { .. } | QueueError::WrongQueue { .. }) => {
                true
            }
            JobError::Transient(_) | JobError::Queue(_) | JobError::Store(_) => false,
        }
    }

    /// Error message followed by its `source()` chain, one cause per line.
    ///
    /// Stored as the dead-letter "stack trace".
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_errors_keep_their_classification() {
        assert!(!JobError::from(SourceError::transient("503")).is_permanent());
        assert!(JobError::from(SourceError::permanent("404")).is_permanent());
        assert!(!JobError::from(StoreError::Unavailable("down".into())).is_permanent());
    }

    #[test]
    fn chain_includes_causes() {
        let err = JobError::Queue(QueueError::InvalidPayload {
            job: "sync-case",
            source: DomainError::validation("bad number"),
        });
        let chain = err.chain();
        assert!(chain.starts_with("invalid sync-case payload"));
        assert!(chain.contains("caused by: validation failed: bad number"));
    }
}
