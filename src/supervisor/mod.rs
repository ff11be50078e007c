//! Lifecycle of the external worker process.
//!
//! [`ProcessSupervisor`] adopts an already-running worker or spawns one,
//! polls its liveness endpoint until it answers, and tears it down on
//! [`stop`](ProcessSupervisor::stop). Other components only see the
//! [`WorkerStatus`] published on a `watch` channel.

mod handle;
mod launch;

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use crate::config::WorkerConfig;
use crate::error::ErrorKind;

pub use handle::{PhaseError, WorkerPhase, WorkerProcessHandle, WorkerStatus};

/// Path of the worker's liveness endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Upper bound for a single liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited during startup ({status})")]
    Exited { status: ExitStatus },

    #[error("worker not ready after {attempts} probes ({waited_ms}ms)")]
    ReadyTimeout { attempts: u32, waited_ms: u64 },

    #[error(transparent)]
    Phase(#[from] PhaseError),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::Spawn { .. } | SupervisorError::Exited { .. } => ErrorKind::Spawn,
            SupervisorError::ReadyTimeout { .. } => ErrorKind::ReadyTimeout,
            SupervisorError::Phase(_) => ErrorKind::Unavailable,
        }
    }
}

/// `GET <base_url>/health`; any 2xx within `limit` counts as alive.
pub async fn probe_health(http: &reqwest::Client, base_url: &str, limit: Duration) -> bool {
    if limit.is_zero() {
        return false;
    }
    match http
        .get(format!("{base_url}{HEALTH_PATH}"))
        .timeout(limit.min(PROBE_TIMEOUT))
        .send()
        .await
    {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::trace!(error = %e, "liveness probe failed");
            false
        }
    }
}

/// Owns one worker process and its handle.
pub struct ProcessSupervisor {
    config: WorkerConfig,
    http: reqwest::Client,
    handle: WorkerProcessHandle,
    status_tx: watch::Sender<WorkerStatus>,
    forwarders: Vec<JoinHandle<()>>,
}

impl ProcessSupervisor {
    pub fn new(config: WorkerConfig) -> Self {
        let handle = WorkerProcessHandle::new(config.base_url());
        let (status_tx, _) = watch::channel(handle.status().clone());
        Self {
            config,
            http: reqwest::Client::new(),
            handle,
            status_tx,
            forwarders: Vec::new(),
        }
    }

    /// Receiver that always holds the current worker status.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> WorkerStatus {
        self.handle.status().clone()
    }

    pub fn base_url(&self) -> &str {
        &self.handle.status().base_url
    }

    pub async fn probe(&self) -> bool {
        probe_health(&self.http, self.base_url(), PROBE_TIMEOUT).await
    }

    /// Total time `start` may spend waiting for the worker to answer.
    fn ready_budget(&self) -> Duration {
        self.config.ready_interval() * self.config.ready_attempts
    }

    /// Makes a worker reachable and returns its status.
    ///
    /// A worker that already answers the liveness probe is adopted as-is;
    /// otherwise a new process is spawned and polled until ready. On failure
    /// the handle is left `FAILED` and a later call retries on a fresh handle.
    pub async fn start(&mut self) -> Result<WorkerStatus, SupervisorError> {
        if self.handle.phase() == WorkerPhase::Ready {
            if self.probe().await {
                return Ok(self.status());
            }
            tracing::warn!(base_url = %self.base_url(), "worker stopped answering, restarting");
            self.transition(WorkerPhase::Failed)?;
        }
        if self.handle.phase() != WorkerPhase::NotStarted {
            self.reset().await;
        }

        self.transition(WorkerPhase::Starting)?;

        let started = Instant::now();
        let deadline = started + self.ready_budget();
        if probe_health(&self.http, self.base_url(), self.config.ready_interval()).await {
            tracing::info!(base_url = %self.base_url(), "worker already running, adopting it");
            self.transition(WorkerPhase::Ready)?;
            return Ok(self.status());
        }

        let command = launch::describe(&self.config);
        tracing::info!(%command, mode = ?self.config.mode, port = self.config.port, "spawning worker");

        let mut child = match launch::build_command(&self.config).spawn() {
            Ok(child) => child,
            Err(source) => {
                tracing::error!(%command, error = %source, "failed to spawn worker");
                self.transition(WorkerPhase::Failed)?;
                return Err(SupervisorError::Spawn { command, source });
            }
        };
        self.forwarders = launch::forward_output(&mut child);
        self.handle.attach(child);
        self.publish();

        match self.wait_until_ready(started, deadline).await {
            Ok(attempts) => {
                self.transition(WorkerPhase::Ready)?;
                tracing::info!(pid = ?self.handle.status().pid, attempts, "worker ready");
                Ok(self.status())
            }
            Err(e) => {
                tracing::error!(error = %e, "worker failed to become ready");
                self.transition(WorkerPhase::Failed)?;
                Err(e)
            }
        }
    }

    /// Probes at the configured interval until the worker answers or
    /// `deadline` passes. Slow probes count against the same deadline.
    async fn wait_until_ready(
        &mut self,
        started: Instant,
        deadline: Instant,
    ) -> Result<u32, SupervisorError> {
        let interval = self.config.ready_interval();
        let max_attempts = self.config.ready_attempts;

        let mut attempts = 0;
        while attempts < max_attempts {
            if let Some(status) = self.handle.exit_status() {
                return Err(SupervisorError::Exited { status });
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;
            if probe_health(&self.http, self.base_url(), remaining).await {
                return Ok(attempts);
            }
            tracing::debug!(attempt = attempts, max_attempts, "worker not ready yet");
            if attempts < max_attempts {
                sleep(interval.min(deadline.saturating_duration_since(Instant::now()))).await;
            }
        }
        if let Some(status) = self.handle.exit_status() {
            return Err(SupervisorError::Exited { status });
        }

        Err(SupervisorError::ReadyTimeout {
            attempts,
            waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Kills the worker if this supervisor spawned it. Idempotent.
    pub async fn stop(&mut self) {
        self.terminate_child().await;
        if matches!(
            self.handle.phase(),
            WorkerPhase::Starting | WorkerPhase::Ready
        ) && let Err(e) = self.transition(WorkerPhase::Stopped)
        {
            tracing::debug!(error = %e, "worker phase not updated on stop");
        }
    }

    async fn terminate_child(&mut self) {
        if let Some(mut child) = self.handle.take_child() {
            let pid = child.id();
            tracing::info!(?pid, "stopping worker");
            if let Err(e) = child.start_kill() {
                tracing::warn!(?pid, error = %e, "failed to signal worker");
            }
            match timeout(self.config.stop_timeout(), child.wait()).await {
                Ok(Ok(status)) => tracing::info!(?pid, %status, "worker exited"),
                Ok(Err(e)) => tracing::warn!(?pid, error = %e, "failed to reap worker"),
                Err(_) => tracing::warn!(?pid, "worker did not exit in time"),
            }
        }
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }

    /// Discards a finished handle so the next start begins at `NOT_STARTED`.
    async fn reset(&mut self) {
        self.terminate_child().await;
        self.handle = WorkerProcessHandle::new(self.config.base_url());
        self.publish();
    }

    fn transition(&mut self, next: WorkerPhase) -> Result<(), PhaseError> {
        self.handle.advance(next)?;
        tracing::debug!(phase = %next, "worker phase changed");
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.handle.status().clone());
    }
}
