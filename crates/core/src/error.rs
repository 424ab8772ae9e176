//! Error model shared by the job subsystem.

use thiserror::Error;

/// Result type for validation of payloads and identifiers.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failures (validation, malformed identifiers).
///
/// Infrastructure failures (store unreachable, network) belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed payload field).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

/// Failure reported by an external data source or delivery channel
/// (court-record API, bar-publication API, SMTP relay, chat API).
///
/// The classification decides retry eligibility: transient failures are
/// expected to heal (timeouts, rate limits, upstream 5xx); permanent ones
/// are not (unknown entity, rejected input).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("transient source failure: {reason}")]
    Transient { reason: String },

    #[error("permanent source failure: {reason}")]
    Permanent { reason: String },
}

impl SourceError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    /// Network timeout talking to the upstream.
    pub fn timeout(target: impl core::fmt::Display) -> Self {
        Self::transient(format!("timed out calling {target}"))
    }

    /// Classify an upstream HTTP status.
    ///
    /// 408, 425, 429 and every 5xx are transient; everything else is permanent.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            408 | 425 | 429 | 500..=599 => Self::transient(format!("upstream status {status}: {body}")),
            _ => Self::permanent(format!("upstream status {status}: {body}")),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient { reason } | Self::Permanent { reason } => reason,
        }
    }
}
