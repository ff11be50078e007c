//! The batch-apply driver.
//!
//! [`BatchApplyPipeline::run`] takes one [`Session`] through
//! resolve → validate → analyze → per-target (match, reserve, compose,
//! submit, record) → aggregate, reporting each step on the session's
//! [`ProgressChannel`]. Jobs run one after another; concurrent sessions only
//! share the quota ledger and the applied registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::{ApplicationRecord, BridgeError, WorkerApi};
use crate::config::PipelineSettings;
use crate::error::{AbortReason, PipelineError};
use crate::progress::{ChannelError, ProgressChannel, ProgressEvent};
use crate::quota::{QuotaHold, QuotaLedger, Reservation};
use crate::state_machine::{
    BatchRun, BatchSummary, InvalidTransition, JobDescriptor, JobOutcome, JobStage,
    PipelineState, Session, Signal, StateMachine, TargetSource, Transition,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound for every worker call made on behalf of a job.
    pub job_timeout: Duration,
    /// Shortest delay before each attempt after the first. Zero disables pacing.
    pub pacing: Duration,
    /// Longest such delay; each delay is drawn from `pacing..=pacing_max`.
    pub pacing_max: Duration,
    /// Message submitted when composition is turned off.
    pub default_greeting: String,
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            job_timeout: settings.job_timeout(),
            pacing: settings.pacing(),
            pacing_max: settings.pacing_max(),
            default_greeting: settings.default_greeting.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InFlight,
    Applied,
}

/// Targets each requester has applied to, or is applying to right now.
#[derive(Debug, Default)]
pub struct AppliedRegistry {
    marks: Mutex<HashMap<String, HashMap<String, Mark>>>,
}

impl AppliedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an application to `target_id` has been confirmed.
    pub fn contains(&self, requester: &str, target_id: &str) -> bool {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(requester)
            .is_some_and(|targets| targets.get(target_id) == Some(&Mark::Applied))
    }

    /// Records a confirmed application. Returns `false` if one was already
    /// confirmed.
    pub fn insert(&self, requester: &str, target_id: &str) -> bool {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(requester.to_string())
            .or_default()
            .insert(target_id.to_string(), Mark::Applied)
            != Some(Mark::Applied)
    }

    /// Takes `target_id` for one attempt. `None` if it is already applied or
    /// another session holds it.
    pub fn try_claim(&self, requester: &str, target_id: &str) -> Option<TargetClaim<'_>> {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        let targets = marks.entry(requester.to_string()).or_default();
        if targets.contains_key(target_id) {
            return None;
        }
        targets.insert(target_id.to_string(), Mark::InFlight);
        Some(TargetClaim {
            registry: self,
            requester: requester.to_string(),
            target_id: target_id.to_string(),
            confirmed: false,
        })
    }

    fn release(&self, requester: &str, target_id: &str) {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(targets) = marks.get_mut(requester)
            && targets.get(target_id) == Some(&Mark::InFlight)
        {
            targets.remove(target_id);
        }
    }
}

/// One session's hold on a target. Dropped without
/// [`confirm`](TargetClaim::confirm), it frees the target again.
#[must_use]
#[derive(Debug)]
pub struct TargetClaim<'a> {
    registry: &'a AppliedRegistry,
    requester: String,
    target_id: String,
    confirmed: bool,
}

impl TargetClaim<'_> {
    /// Marks the target as applied for good.
    pub fn confirm(mut self) {
        self.registry.insert(&self.requester, &self.target_id);
        self.confirmed = true;
    }
}

impl Drop for TargetClaim<'_> {
    fn drop(&mut self) {
        if !self.confirmed {
            self.registry.release(&self.requester, &self.target_id);
        }
    }
}

/// Everything a finished session produced.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub session_id: Uuid,
    pub state: PipelineState,
    pub state_history: Vec<PipelineState>,
    pub outcomes: Vec<JobOutcome>,
    pub summary: Option<BatchSummary>,
    pub abort: Option<AbortReason>,
    /// Quota units spent on attempted targets.
    pub charged: u32,
    /// Quota units reserved and then given back.
    pub refunded: u32,
}

/// Result of one attempt that reached the worker.
struct Attempt {
    outcome: JobOutcome,
    /// Message actually submitted; `None` when the job stopped before submit.
    greeting: Option<String>,
}

#[derive(Default)]
struct Charges {
    charged: u32,
    refunded: u32,
}

pub struct BatchApplyPipeline<W> {
    worker: W,
    ledger: Arc<QuotaLedger>,
    applied: Arc<AppliedRegistry>,
    config: PipelineConfig,
}

impl<W: WorkerApi> BatchApplyPipeline<W> {
    pub fn new(worker: W, ledger: Arc<QuotaLedger>, config: PipelineConfig) -> Self {
        Self {
            worker,
            ledger,
            applied: Arc::new(AppliedRegistry::new()),
            config,
        }
    }

    /// Shares an applied registry with other pipelines.
    pub fn with_registry(mut self, applied: Arc<AppliedRegistry>) -> Self {
        self.applied = applied;
        self
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    /// Runs `session` to its terminal event.
    ///
    /// Always ends with exactly one `Completed` or `Failed` event on
    /// `progress` (unless the consumer is already gone). `cancel` is checked
    /// between jobs and during pacing; a job already talking to the worker is
    /// allowed to finish.
    pub async fn run(
        &self,
        session: &Session,
        progress: &mut ProgressChannel,
        cancel: &CancellationToken,
    ) -> BatchReport {
        tracing::info!(session = %session.id, requester = %session.requester, "batch started");

        let mut run = BatchRun::new(session.id);
        let mut charges = Charges::default();
        let result = self
            .drive(session, &mut run, &mut charges, progress, cancel)
            .await;

        let (summary, abort) = match result {
            Ok(summary) => {
                tracing::info!(
                    session = %session.id,
                    succeeded = summary.success_count,
                    failed = summary.failed_count,
                    halted = summary.halted.is_some(),
                    "batch completed"
                );
                if let Err(e) = progress.complete(summary.clone()).await {
                    tracing::debug!(session = %session.id, error = %e, "completion not delivered");
                }
                (Some(summary), None)
            }
            Err(err) => {
                let reason = AbortReason::from(err);
                if !run.state.is_terminal()
                    && let Err(e) = StateMachine::next(&mut run, Signal::Abort(reason.clone()))
                {
                    tracing::debug!(session = %session.id, error = %e, "abort not recorded");
                }
                tracing::warn!(session = %session.id, reason = %reason, "batch aborted");
                if let Err(e) = progress.fail(reason.clone()).await {
                    tracing::debug!(session = %session.id, error = %e, "failure not delivered");
                }
                (None, Some(reason))
            }
        };

        BatchReport {
            session_id: session.id,
            state: run.state,
            state_history: run.state_history,
            outcomes: run.outcomes,
            summary,
            abort,
            charged: charges.charged,
            refunded: charges.refunded,
        }
    }

    async fn drive(
        &self,
        session: &Session,
        run: &mut BatchRun,
        charges: &mut Charges,
        progress: &mut ProgressChannel,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, PipelineError> {
        // CREATED: resolve and validate targets
        let targets = self.resolve_targets(session, progress).await?;
        run.total = targets.len();
        if targets.is_empty() {
            return Err(PipelineError::Validation("no targets to apply to".into()));
        }
        step(run, Signal::Validated)?;

        let analysis = self.analyze(session, progress).await?;

        // DISPATCHING: one target at a time, in caller order
        let mut attempts = 0usize;
        for (index, job) in targets.iter().enumerate() {
            let last = index + 1 == targets.len();
            check_cancelled(progress, cancel)?;

            let claim = if session.options.skip_applied {
                match self.applied.try_claim(&session.requester, &job.id) {
                    Some(claim) => Some(claim),
                    None => {
                        let reason = if self.applied.contains(&session.requester, &job.id) {
                            "already applied"
                        } else {
                            "being applied by another session"
                        };
                        tracing::info!(session = %session.id, target = %job.id, reason, "skipping target");
                        let outcome = JobOutcome::failed(job, JobStage::Match, reason);
                        step(run, Signal::Skipped(outcome.clone()))?;
                        self.report(run, outcome, progress, last).await?;
                        continue;
                    }
                }
            } else {
                None
            };

            let hold = match self.ledger.reserve(&session.requester, 1)? {
                Reservation::Granted(hold) => hold,
                Reservation::Denied { remaining } => {
                    tracing::info!(
                        session = %session.id,
                        requester = %session.requester,
                        remaining,
                        processed = run.processed(),
                        "quota exhausted, stopping dispatch"
                    );
                    match step(run, Signal::QuotaExhausted)? {
                        Transition::Abort(reason) => return Err(PipelineError::Halted(reason)),
                        _ => break,
                    }
                }
            };

            let pause = if attempts > 0 { self.pacing_delay() } else { Duration::ZERO };
            if !pause.is_zero() {
                tracing::debug!(session = %session.id, pause_ms = pause.as_millis() as u64, "pacing");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(pause) => {}
                }
            }
            if let Err(e) = check_cancelled(progress, cancel) {
                self.refund(hold, charges)?;
                return Err(e);
            }

            // ATTEMPTING
            if let Err(e) = step(run, Signal::Reserved) {
                self.refund(hold, charges)?;
                return Err(e);
            }
            attempts += 1;
            let attempt = match self.attempt(session, job, analysis.as_ref()).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    tracing::error!(session = %session.id, target = %job.id, error = %e, "worker unreachable");
                    self.refund(hold, charges)?;
                    return Err(e.into());
                }
            };
            charges.charged += hold.commit();

            let mut outcome = attempt.outcome;
            if outcome.success {
                match claim {
                    Some(claim) => claim.confirm(),
                    None => {
                        self.applied.insert(&session.requester, &job.id);
                    }
                }
            }
            if session.options.record_outcomes
                && let Some(greeting) = &attempt.greeting
            {
                self.record(session, &mut outcome, greeting).await;
            }

            step(run, Signal::Finished(outcome.clone()))?;
            self.report(run, outcome, progress, last).await?;
        }

        // AGGREGATING
        if run.state == PipelineState::Dispatching {
            step(run, Signal::Drained)?;
        }
        match step(run, Signal::Aggregate)? {
            Transition::Complete(summary) => Ok(summary),
            _ => Err(InvalidTransition {
                state: run.state,
                signal: "aggregate",
            }
            .into()),
        }
    }

    async fn resolve_targets(
        &self,
        session: &Session,
        progress: &mut ProgressChannel,
    ) -> Result<Vec<JobDescriptor>, PipelineError> {
        let mut targets = match &session.source {
            TargetSource::Explicit(targets) => targets.clone(),
            TargetSource::Search(criteria) => {
                progress.emit(ProgressEvent::stage("searching", 0.0)).await?;
                let found = self.timed(self.worker.search(criteria)).await?;
                tracing::info!(session = %session.id, found = found.len(), keywords = %criteria.keywords, "search finished");
                progress.emit(ProgressEvent::stage("found", 0.0)).await?;
                found
            }
        };
        if let Some(max) = session.options.max_jobs {
            targets.truncate(max);
        }
        Ok(targets)
    }

    /// Optional resume analysis. Only an unreachable worker is fatal here.
    async fn analyze(
        &self,
        session: &Session,
        progress: &mut ProgressChannel,
    ) -> Result<Option<Value>, PipelineError> {
        if !session.options.analyze_resume || session.resume_text.trim().is_empty() {
            return Ok(None);
        }
        progress.emit(ProgressEvent::stage("analyzing", 0.0)).await?;
        match self.timed(self.worker.analyze_resume(&session.resume_text)).await {
            Ok(analysis) => Ok(Some(analysis)),
            Err(e) if e.is_transport_level() => Err(e.into()),
            Err(e) => {
                tracing::warn!(session = %session.id, error = %e, "resume analysis failed, continuing without it");
                Ok(None)
            }
        }
    }

    /// Compose and submit one target. Job-level failures come back as a
    /// failed outcome; only transport-level failures are errors.
    async fn attempt(
        &self,
        session: &Session,
        job: &JobDescriptor,
        analysis: Option<&Value>,
    ) -> Result<Attempt, BridgeError> {
        let greeting = if session.options.compose_message {
            match self
                .timed(self.worker.compose(job, &session.resume_text, analysis))
                .await
            {
                Ok(message) => message,
                Err(e) if e.is_transport_level() => return Err(e),
                Err(e) => {
                    tracing::warn!(session = %session.id, target = %job.id, error = %e, "compose failed");
                    return Ok(Attempt {
                        outcome: JobOutcome::failed(job, JobStage::Compose, e.to_string()),
                        greeting: None,
                    });
                }
            }
        } else {
            self.config.default_greeting.clone()
        };

        let receipt = match self.timed(self.worker.submit(&job.id, &greeting)).await {
            Ok(receipt) => receipt,
            Err(e) if e.is_transport_level() => return Err(e),
            Err(e) => {
                tracing::warn!(session = %session.id, target = %job.id, error = %e, "submit failed");
                return Ok(Attempt {
                    outcome: JobOutcome::failed(job, JobStage::Submit, e.to_string()),
                    greeting: Some(greeting),
                });
            }
        };

        let outcome = if receipt.success {
            let message = non_empty(receipt.message, "applied");
            tracing::info!(session = %session.id, target = %job.id, "application sent");
            JobOutcome::succeeded(job, JobStage::Submit, message)
        } else {
            let message = non_empty(receipt.message, "application rejected");
            tracing::info!(session = %session.id, target = %job.id, %message, "application rejected");
            JobOutcome::failed(job, JobStage::Submit, message)
        };
        Ok(Attempt {
            outcome,
            greeting: Some(greeting),
        })
    }

    /// Best effort: a failed record is logged and the outcome stays at submit.
    async fn record(&self, session: &Session, outcome: &mut JobOutcome, greeting: &str) {
        let record =
            ApplicationRecord::from_outcome(session.id, &session.requester, outcome, greeting);
        match self.timed(self.worker.record(&record)).await {
            Ok(()) => outcome.stage = JobStage::Record,
            Err(e) => {
                tracing::warn!(session = %session.id, target = %outcome.target_id, error = %e, "record not stored");
            }
        }
    }

    async fn report(
        &self,
        run: &BatchRun,
        outcome: JobOutcome,
        progress: &mut ProgressChannel,
        last: bool,
    ) -> Result<(), ChannelError> {
        progress.emit(ProgressEvent::JobResult { outcome }).await?;
        if !last {
            progress
                .emit(ProgressEvent::stage("applying", run.fraction()))
                .await?;
        }
        Ok(())
    }

    fn pacing_delay(&self) -> Duration {
        let PipelineConfig {
            pacing, pacing_max, ..
        } = &self.config;
        if pacing.is_zero() || pacing_max <= pacing {
            return *pacing;
        }
        rand::rng().random_range(*pacing..=*pacing_max)
    }

    fn refund(&self, hold: QuotaHold, charges: &mut Charges) -> Result<(), PipelineError> {
        let units = hold.units();
        self.ledger.refund(hold)?;
        charges.refunded += units;
        Ok(())
    }

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, BridgeError>>,
    ) -> Result<T, BridgeError> {
        timeout(self.config.job_timeout, call)
            .await
            .map_err(|_| BridgeError::Timeout(self.config.job_timeout))?
    }
}

fn step(run: &mut BatchRun, signal: Signal) -> Result<Transition, PipelineError> {
    Ok(StateMachine::next(run, signal)?)
}

fn check_cancelled(
    progress: &ProgressChannel,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled("cancelled by caller".into()));
    }
    if progress.is_closed() {
        return Err(ChannelError::Closed.into());
    }
    Ok(())
}

fn non_empty(message: String, fallback: &str) -> String {
    if message.trim().is_empty() {
        fallback.to_string()
    } else {
        message
    }
}
