use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::job::{BatchSummary, JobOutcome};
use crate::error::{AbortReason, ErrorKind};

/// States of a batch run.
///
/// A run flows CREATED → DISPATCHING ⇄ ATTEMPTING → AGGREGATING → COMPLETED,
/// and any non-terminal state may move to ABORTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Created,
    Dispatching,
    Attempting,
    Aggregating,
    Completed,
    Aborted,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Aborted)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Created => write!(f, "CREATED"),
            PipelineState::Dispatching => write!(f, "DISPATCHING"),
            PipelineState::Attempting => write!(f, "ATTEMPTING"),
            PipelineState::Aggregating => write!(f, "AGGREGATING"),
            PipelineState::Completed => write!(f, "COMPLETED"),
            PipelineState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Input driving a run from one state to the next.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// The target list is non-empty.
    Validated,
    /// A target was rejected before any quota was taken.
    Skipped(JobOutcome),
    /// A quota unit was reserved for the next target.
    Reserved,
    /// The in-flight target finished, successfully or not.
    Finished(JobOutcome),
    /// The ledger refused the next reservation.
    QuotaExhausted,
    /// Every target has been dispatched.
    Drained,
    Aggregate,
    Abort(AbortReason),
}

impl Signal {
    fn name(&self) -> &'static str {
        match self {
            Signal::Validated => "validated",
            Signal::Skipped(_) => "skipped",
            Signal::Reserved => "reserved",
            Signal::Finished(_) => "finished",
            Signal::QuotaExhausted => "quota_exhausted",
            Signal::Drained => "drained",
            Signal::Aggregate => "aggregate",
            Signal::Abort(_) => "abort",
        }
    }
}

/// Result of applying a signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next(PipelineState),
    Complete(BatchSummary),
    Abort(AbortReason),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("signal `{signal}` is not valid in state {state}")]
pub struct InvalidTransition {
    pub state: PipelineState,
    pub signal: &'static str,
}

/// Mutable bookkeeping of one session's run.
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub session_id: Uuid,
    pub total: usize,
    pub state: PipelineState,
    pub state_history: Vec<PipelineState>,
    /// Targets taken off the list so far, including skipped ones.
    pub dispatched: usize,
    pub outcomes: Vec<JobOutcome>,
    pub halted: Option<AbortReason>,
}

impl BatchRun {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            total: 0,
            state: PipelineState::Created,
            state_history: Vec::new(),
            dispatched: 0,
            outcomes: Vec::new(),
            halted: None,
        }
    }

    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.processed() - self.success_count()
    }

    /// Share of targets processed, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.processed() as f64 / self.total as f64
        }
    }
}

/// Drives a [`BatchRun`] through its states.
pub struct StateMachine;

impl StateMachine {
    /// Applies `signal` to `run` and returns the resulting transition.
    ///
    /// Quota exhaustion moves to AGGREGATING when at least one target has an
    /// outcome (partial completion) and aborts the run otherwise.
    pub fn next(run: &mut BatchRun, signal: Signal) -> Result<Transition, InvalidTransition> {
        use PipelineState::*;

        let state = run.state;
        let transition = match (state, signal) {
            (Created, Signal::Validated) => Transition::Next(Dispatching),
            (Dispatching, Signal::Skipped(outcome)) => {
                run.dispatched += 1;
                run.outcomes.push(outcome);
                Transition::Next(Dispatching)
            }
            (Dispatching, Signal::Reserved) => {
                run.dispatched += 1;
                Transition::Next(Attempting)
            }
            (Attempting, Signal::Finished(outcome)) => {
                run.outcomes.push(outcome);
                Transition::Next(Dispatching)
            }
            (Dispatching, Signal::QuotaExhausted) => {
                let reason = AbortReason::quota_exhausted(run.processed(), run.total);
                if run.outcomes.is_empty() {
                    Transition::Abort(AbortReason::new(
                        ErrorKind::QuotaDenied,
                        "no quota remaining for this requester",
                    ))
                } else {
                    run.halted = Some(reason);
                    Transition::Next(Aggregating)
                }
            }
            (Dispatching, Signal::Drained) => Transition::Next(Aggregating),
            (Aggregating, Signal::Aggregate) => Transition::Complete(BatchSummary::from_outcomes(
                run.total,
                run.dispatched,
                &run.outcomes,
                run.halted.clone(),
            )),
            (Created | Dispatching | Attempting | Aggregating, Signal::Abort(reason)) => {
                Transition::Abort(reason)
            }
            (state, signal) => {
                return Err(InvalidTransition {
                    state,
                    signal: signal.name(),
                });
            }
        };

        let next_state = match &transition {
            Transition::Next(next) => *next,
            Transition::Complete(_) => Completed,
            Transition::Abort(_) => Aborted,
        };
        if next_state != state {
            run.state_history.push(state);
            run.state = next_state;
        }

        Ok(transition)
    }
}
