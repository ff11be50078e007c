use std::fmt;
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Child;

/// Lifecycle phase of a supervised worker.
///
/// A handle flows `NOT_STARTED → STARTING → READY`, and from `STARTING` or
/// `READY` into `FAILED` or `STOPPED`. Phases never revert; a new start after
/// `FAILED`/`STOPPED` gets a fresh handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    NotStarted,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl WorkerPhase {
    pub fn can_advance_to(self, next: WorkerPhase) -> bool {
        use WorkerPhase::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Ready)
                | (Starting | Ready, Failed)
                | (Starting | Ready, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerPhase::Failed | WorkerPhase::Stopped)
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::NotStarted => write!(f, "NOT_STARTED"),
            WorkerPhase::Starting => write!(f, "STARTING"),
            WorkerPhase::Ready => write!(f, "READY"),
            WorkerPhase::Failed => write!(f, "FAILED"),
            WorkerPhase::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Read-only view of a worker handle, published to every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub phase: WorkerPhase,
    /// `None` when the worker was adopted rather than spawned.
    pub pid: Option<u32>,
    pub base_url: String,
}

impl WorkerStatus {
    pub fn is_ready(&self) -> bool {
        self.phase == WorkerPhase::Ready
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal worker phase transition {from} -> {to}")]
pub struct PhaseError {
    pub from: WorkerPhase,
    pub to: WorkerPhase,
}

/// The spawned process (if any) plus its phase.
#[derive(Debug)]
pub struct WorkerProcessHandle {
    status: WorkerStatus,
    child: Option<Child>,
    phase_history: Vec<WorkerPhase>,
}

impl WorkerProcessHandle {
    pub fn new(base_url: String) -> Self {
        Self {
            status: WorkerStatus {
                phase: WorkerPhase::NotStarted,
                pid: None,
                base_url,
            },
            child: None,
            phase_history: Vec::new(),
        }
    }

    pub fn status(&self) -> &WorkerStatus {
        &self.status
    }

    pub fn phase(&self) -> WorkerPhase {
        self.status.phase
    }

    pub fn phase_history(&self) -> &[WorkerPhase] {
        &self.phase_history
    }

    pub fn advance(&mut self, next: WorkerPhase) -> Result<(), PhaseError> {
        let from = self.status.phase;
        if !from.can_advance_to(next) {
            return Err(PhaseError { from, to: next });
        }
        self.phase_history.push(from);
        self.status.phase = next;
        Ok(())
    }

    pub fn attach(&mut self, child: Child) {
        self.status.pid = child.id();
        self.child = Some(child);
    }

    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Exit status of the child if it has already terminated.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "could not poll worker process");
                None
            }
        }
    }
}
