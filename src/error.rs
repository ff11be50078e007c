use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::BridgeError;
use crate::progress::ChannelError;
use crate::quota::QuotaError;
use crate::state_machine::InvalidTransition;

/// Classification shared by every component error.
///
/// `Job` is the only kind a batch survives; every other kind ends the
/// current session with a single `Failed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The OS refused to create the worker, or it died during startup.
    Spawn,
    /// The worker never answered its liveness probe.
    ReadyTimeout,
    /// No worker is `Ready`.
    Unavailable,
    /// Network failure or call timeout talking to the worker.
    Transport,
    /// The worker answered with a non-success status or an unreadable body.
    Upstream,
    /// The requester has no allowance left.
    QuotaDenied,
    /// Empty or malformed session input.
    Validation,
    /// Per-job business failure.
    Job,
    /// The caller cancelled or went away.
    Cancelled,
}

impl ErrorKind {
    /// Whether an error of this kind ends the whole session.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ErrorKind::Job)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Spawn => "spawn",
            ErrorKind::ReadyTimeout => "ready timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Transport => "transport",
            ErrorKind::Upstream => "upstream",
            ErrorKind::QuotaDenied => "quota denied",
            ErrorKind::Validation => "validation",
            ErrorKind::Job => "job",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors raised while driving a batch session.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid session: {0}")]
    Validation(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    State(#[from] InvalidTransition),

    #[error("session cancelled: {0}")]
    Cancelled(String),

    /// The run was ended by the state machine itself.
    #[error("{0}")]
    Halted(AbortReason),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Validation(_) | PipelineError::State(_) => ErrorKind::Validation,
            PipelineError::Bridge(e) => e.kind(),
            PipelineError::Quota(e) => e.kind(),
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::Halted(reason) => reason.kind,
        }
    }
}

impl From<ChannelError> for PipelineError {
    fn from(err: ChannelError) -> Self {
        PipelineError::Cancelled(err.to_string())
    }
}

/// Why a session stopped before finishing its target list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl AbortReason {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn quota_exhausted(processed: usize, total: usize) -> Self {
        Self::new(
            ErrorKind::QuotaDenied,
            format!("quota exhausted after {processed} of {total} targets"),
        )
    }
}

impl From<PipelineError> for AbortReason {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Halted(reason) => reason,
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
