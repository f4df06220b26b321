//! Error types for the edgequake-docops library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`DocOpsError`]: **synchronous**. The request is refused before any
//!   operation session exists (malformed input, another session active,
//!   bad priority index) or a settings mutation could not be applied.
//!   Returned as `Err(DocOpsError)` from the public entry points.
//!
//! * [`ExchangeError`]: **per attempt**. One technology failed to fulfil
//!   the exchange. It never escapes as an `Err`; the session classifies it
//!   into a [`FailureReason`], decides whether to fall back to the next
//!   technology, and attaches the last reason to the terminal outcome.
//!
//! [`ErrorKind`] folds both into the user-facing taxonomy the console
//! renders.

use crate::catalog::{OperationFamily, TechnologyId};
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The user-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing input; never reaches the exchange executor.
    Validation,
    /// Another operation session is in flight.
    AdmissionRejected,
    /// The exchange failed to complete at the network level.
    Transport,
    /// The exchange completed but the remote party declined it.
    RemoteRefusal,
    /// The exchange exceeded the configured ceiling.
    Timeout,
    /// Deliberate user cancellation. Not a true error.
    Cancelled,
    /// Settings, persistence or internal failures outside any session.
    Internal,
}

/// All synchronous errors returned by the edgequake-docops library.
///
/// Attempt-level failures use [`ExchangeError`] and end up inside
/// [`crate::session::SessionOutcome::Failed`] rather than here.
#[derive(Debug, Error)]
pub enum DocOpsError {
    // ── Admission errors ─────────────────────────────────────────────────
    /// The request is malformed or references missing input.
    #[error("Invalid request for '{family}': {reason}")]
    Validation {
        family: OperationFamily,
        reason: String,
    },

    /// An input file could not be found or is not a regular file.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    InputNotFound { path: PathBuf },

    /// Another session is still non-terminal in the same guard scope.
    #[error("Another operation in progress ({family}, session {active}); wait for it to finish or cancel it")]
    AdmissionRejected {
        active: SessionId,
        family: OperationFamily,
    },

    /// The family is not declared by the technology catalog.
    #[error("Unknown operation family '{0}'")]
    UnknownFamily(String),

    // ── Settings errors ──────────────────────────────────────────────────
    /// A positional argument is outside `0..len`.
    #[error("Index {index} is out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// A priority list failed validation and was not applied.
    #[error("Invalid priority list for '{family}': {reason}")]
    InvalidPriorityList {
        family: OperationFamily,
        reason: String,
    },

    /// The persistence sink refused a write; the previous list is retained.
    #[error("Failed to persist priorities to '{path}': {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored priorities exist but are not valid JSON.
    #[error("Corrupt priority store '{path}': {detail}")]
    CorruptPriorityStore { path: PathBuf, detail: String },

    /// The technology catalog could not be loaded or parsed.
    #[error("Failed to load technology catalog from '{source_name}': {detail}")]
    CatalogLoad { source_name: String, detail: String },

    // ── Config errors ────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `admit_and_run` was called outside a tokio runtime.
    #[error("No tokio runtime available to drive the operation session")]
    NoRuntime,

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocOpsError {
    /// Map into the user-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocOpsError::Validation { .. }
            | DocOpsError::InputNotFound { .. }
            | DocOpsError::UnknownFamily(_)
            | DocOpsError::IndexOutOfRange { .. } => ErrorKind::Validation,
            DocOpsError::AdmissionRejected { .. } => ErrorKind::AdmissionRejected,
            _ => ErrorKind::Internal,
        }
    }
}

/// A failure reported by the exchange executor for one attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// The exchange failed to complete (connection, I/O, 5xx).
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote party answered and declined (quota, unsupported format…).
    #[error("refused by remote{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    RemoteRefusal { status: Option<u16>, detail: String },

    /// The attempt exceeded the configured ceiling.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The executor observed the cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
}

/// The classified reason attached to a failed attempt or a `Failed` session.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("{technology}: transport error: {detail}")]
    Transport {
        technology: TechnologyId,
        detail: String,
    },

    #[error("{technology}: refused{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    RemoteRefusal {
        technology: TechnologyId,
        status: Option<u16>,
        detail: String,
    },

    #[error("{technology}: timed out after {secs}s")]
    Timeout { technology: TechnologyId, secs: u64 },

    /// The resolver produced no candidate for the family.
    #[error("no technology available for '{family}'")]
    NoCandidates { family: OperationFamily },

    /// The session runner itself broke, not the technology.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl FailureReason {
    /// Classify an executor error for the technology that produced it.
    ///
    /// Returns `None` for [`ExchangeError::Cancelled`]: cancellation is a
    /// terminal state, not a failure.
    pub fn classify(technology: &TechnologyId, err: ExchangeError) -> Option<Self> {
        let technology = technology.clone();
        match err {
            ExchangeError::Transport(detail) => Some(FailureReason::Transport { technology, detail }),
            ExchangeError::RemoteRefusal { status, detail } => Some(FailureReason::RemoteRefusal {
                technology,
                status,
                detail,
            }),
            ExchangeError::Timeout { secs } => Some(FailureReason::Timeout { technology, secs }),
            ExchangeError::Cancelled => None,
        }
    }

    /// Map into the user-facing taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureReason::Transport { .. } => ErrorKind::Transport,
            FailureReason::RemoteRefusal { .. } => ErrorKind::RemoteRefusal,
            FailureReason::Timeout { .. } => ErrorKind::Timeout,
            FailureReason::NoCandidates { .. } => ErrorKind::Validation,
            FailureReason::Internal { .. } => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_rejected_display_mentions_reason() {
        let e = DocOpsError::AdmissionRejected {
            active: SessionId::new_v4(),
            family: OperationFamily::new("merge").unwrap(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Another operation in progress"), "got: {msg}");
        assert!(msg.contains("merge"));
        assert_eq!(e.kind(), ErrorKind::AdmissionRejected);
    }

    #[test]
    fn validation_errors_share_a_kind() {
        assert_eq!(
            DocOpsError::IndexOutOfRange { index: 4, len: 2 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            DocOpsError::UnknownFamily("nope".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(DocOpsError::InvalidConfig("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn remote_refusal_display_with_status() {
        let e = ExchangeError::RemoteRefusal {
            status: Some(402),
            detail: "quota exhausted".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("HTTP 402"), "got: {msg}");
        assert!(msg.contains("quota exhausted"));
    }

    #[test]
    fn classify_keeps_technology_and_kind() {
        let tech = TechnologyId::new("adobe");
        let reason = FailureReason::classify(&tech, ExchangeError::Timeout { secs: 30 }).unwrap();
        assert_eq!(reason.kind(), ErrorKind::Timeout);
        assert!(reason.to_string().contains("adobe"));
        assert!(reason.to_string().contains("30s"));
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        let tech = TechnologyId::new("adobe");
        assert!(FailureReason::classify(&tech, ExchangeError::Cancelled).is_none());
    }

    #[test]
    fn failure_reason_serialises_with_kind_tag() {
        let reason = FailureReason::Transport {
            technology: TechnologyId::new("libreoffice"),
            detail: "connection reset".into(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["kind"], "transport");
        assert_eq!(json["technology"], "libreoffice");
    }
}
