//! Ordered progress reporting for one session.
//!
//! A [`ProgressChannel`] is the producer half held by whoever drives the
//! session; the caller reads the [`ProgressStream`]. The channel is bounded,
//! so a slow consumer suspends the producer. Exactly one terminal event
//! (`Completed` or `Failed`) is ever delivered, and stage fractions never
//! move backwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{AbortReason, ErrorKind};
use crate::state_machine::{BatchSummary, JobOutcome};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stage { name: String, fraction: f64 },
    JobResult { outcome: JobOutcome },
    Completed { summary: BatchSummary },
    Failed { error: AbortReason },
}

impl ProgressEvent {
    pub fn stage(name: impl Into<String>, fraction: f64) -> Self {
        ProgressEvent::Stage {
            name: name.into(),
            fraction,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. } | ProgressEvent::Failed { .. }
        )
    }

    /// Progress fraction carried by the event, if any.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            ProgressEvent::Stage { fraction, .. } => Some(*fraction),
            ProgressEvent::Completed { .. } => Some(1.0),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("progress consumer disconnected")]
    Closed,

    #[error("session already reported its terminal event")]
    Terminated,
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Closed => ErrorKind::Cancelled,
            ChannelError::Terminated => ErrorKind::Validation,
        }
    }
}

/// Creates a session channel holding at most `capacity` undelivered events.
pub fn channel(session_id: Uuid, capacity: usize) -> (ProgressChannel, ProgressStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressChannel {
            session_id,
            tx,
            last_fraction: 0.0,
            terminated: false,
        },
        ProgressStream { rx },
    )
}

/// Producer half of a session's progress.
#[derive(Debug)]
pub struct ProgressChannel {
    session_id: Uuid,
    tx: mpsc::Sender<ProgressEvent>,
    last_fraction: f64,
    terminated: bool,
}

impl ProgressChannel {
    /// Whether the consumer has dropped its stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Sends `event`, waiting for room in the buffer.
    ///
    /// Stage fractions below the last one sent, or at/above 1.0, are held at
    /// the last value; only `Completed` reaches 1.0. After a terminal event
    /// nothing more is sent.
    pub async fn emit(&mut self, event: ProgressEvent) -> Result<(), ChannelError> {
        if self.terminated {
            tracing::warn!(session = %self.session_id, ?event, "event after terminal dropped");
            return Err(ChannelError::Terminated);
        }

        let event = match event {
            ProgressEvent::Stage { name, fraction } => {
                if fraction.is_nan() || fraction < self.last_fraction || fraction >= 1.0 {
                    ProgressEvent::Stage {
                        name,
                        fraction: self.last_fraction,
                    }
                } else {
                    self.last_fraction = fraction;
                    ProgressEvent::Stage { name, fraction }
                }
            }
            ProgressEvent::Completed { summary } => {
                self.last_fraction = 1.0;
                ProgressEvent::Completed { summary }
            }
            other => other,
        };
        if event.is_terminal() {
            self.terminated = true;
        }

        tracing::trace!(session = %self.session_id, ?event, "progress");
        self.tx.send(event).await.map_err(|_| ChannelError::Closed)
    }

    pub async fn complete(&mut self, summary: BatchSummary) -> Result<(), ChannelError> {
        self.emit(ProgressEvent::Completed { summary }).await
    }

    pub async fn fail(&mut self, error: AbortReason) -> Result<(), ChannelError> {
        self.emit(ProgressEvent::Failed { error }).await
    }
}

/// Consumer half of a session's progress.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressStream {
    /// Next event, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Reads events up to and including the terminal one.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
}
