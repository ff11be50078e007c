use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::supervisor::WorkerPhase;

/// Errors raised while talking to the worker.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The supervisor does not report the worker `READY`.
    #[error("worker unavailable (phase {phase})")]
    Unavailable { phase: WorkerPhase },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("worker call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The worker answered with a non-2xx status.
    #[error("worker error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    /// A 2xx body, or a stream frame, did not have the expected shape.
    #[error("unexpected worker payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Unavailable { .. } => ErrorKind::Unavailable,
            BridgeError::Http(e) if e.is_decode() => ErrorKind::Upstream,
            BridgeError::Http(_) | BridgeError::WebSocket(_) | BridgeError::Timeout(_) => {
                ErrorKind::Transport
            }
            BridgeError::Upstream { .. } | BridgeError::Decode(_) => ErrorKind::Upstream,
        }
    }

    /// Whether the failure says nothing about the job itself, only about the
    /// path to the worker. Such failures end the whole session.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Unavailable
        )
    }
}
