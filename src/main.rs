mod bridge;
mod cli;
mod config;
mod error;
mod pipeline;
mod progress;
mod quota;
mod relay;
mod state_machine;
mod supervisor;
mod ui;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use console::Style;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bridge::{BridgeClient, STREAM_PATHS};
use cli::{Cli, Command};
use config::{AccountSeed, AppConfig};
use pipeline::{BatchApplyPipeline, PipelineConfig};
use quota::{PlanTier, QuotaAccount, QuotaLedger};
use state_machine::{Session, SessionRequest};
use supervisor::{ProcessSupervisor, WorkerStatus};
use ui::SessionProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Run { file, account } => run_batch(&config, &file, account, &cancel).await,
        Command::Relay { endpoint, file } => relay_batch(&config, &endpoint, &file, &cancel).await,
        Command::Worker => hold_worker(&config, &cancel).await,
        Command::Probe => probe(&config).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "applyd=debug,worker=debug"
    } else {
        "applyd=info,worker=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Starts the worker, stopping it again if it never becomes ready.
async fn start_worker(supervisor: &mut ProcessSupervisor) -> Result<WorkerStatus> {
    match supervisor.start().await {
        Ok(status) => Ok(status),
        Err(e) => {
            supervisor.stop().await;
            Err(e).context("worker did not start")
        }
    }
}

async fn run_batch(
    config: &AppConfig,
    file: &Path,
    account: Option<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut request = SessionRequest::load(file)?;
    if let Some(account) = account {
        request.requester = account;
    }
    let session = Session::from_request(request)?;

    let ledger = Arc::new(QuotaLedger::with_accounts(
        config.accounts.iter().map(AccountSeed::to_account),
    ));
    if ledger.balance(&session.requester).is_err() {
        tracing::info!(requester = %session.requester, "no configured account, using the free plan");
        ledger.open(QuotaAccount::new(&session.requester, PlanTier::Free));
    }

    let mut supervisor = ProcessSupervisor::new(config.worker.clone());
    let status = start_worker(&mut supervisor).await?;
    tracing::info!(base_url = %status.base_url, pid = ?status.pid, "worker ready");

    let client = BridgeClient::new(supervisor.subscribe(), config.worker.connect_timeout())?;
    let pipeline = BatchApplyPipeline::new(
        client,
        Arc::clone(&ledger),
        PipelineConfig::from(&config.pipeline),
    );

    let (mut tx, rx) = progress::channel(session.id, config.pipeline.event_buffer);
    let view = SessionProgress::start(&format!("session {}", session.id));
    let (report, _) = tokio::join!(pipeline.run(&session, &mut tx, cancel), view.drive(rx));

    supervisor.stop().await;
    ui::print_balances(&ledger.snapshot());

    match report.abort {
        Some(reason) => bail!("session {} aborted: {reason}", session.id),
        None => Ok(()),
    }
}

async fn relay_batch(
    config: &AppConfig,
    endpoint: &str,
    file: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    if !STREAM_PATHS.contains(&endpoint) {
        bail!(
            "unknown streaming endpoint {endpoint} (expected one of {})",
            STREAM_PATHS.join(", ")
        );
    }
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("reading request file {}", file.display()))?;
    let request: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("parsing request file {}", file.display()))?;

    let mut supervisor = ProcessSupervisor::new(config.worker.clone());
    start_worker(&mut supervisor).await?;
    let client = BridgeClient::new(supervisor.subscribe(), config.worker.connect_timeout())?;

    let session_id = uuid::Uuid::new_v4();
    let (mut tx, rx) = progress::channel(session_id, config.pipeline.event_buffer);
    let view = SessionProgress::start(endpoint);
    let (result, _) = tokio::join!(
        relay::relay_session(&client, endpoint, &request, &mut tx, cancel),
        view.drive(rx)
    );

    supervisor.stop().await;
    result
        .map(|_| ())
        .map_err(|reason| anyhow!("relayed session failed: {reason}"))
}

async fn hold_worker(config: &AppConfig, cancel: &CancellationToken) -> Result<()> {
    let mut supervisor = ProcessSupervisor::new(config.worker.clone());
    let status = start_worker(&mut supervisor).await?;

    let green = Style::new().green().bold();
    match status.pid {
        Some(pid) => println!(
            "  {} worker {} at {} (pid {pid}), Ctrl-C to stop",
            green.apply_to("✓"),
            status.phase,
            status.base_url
        ),
        None => println!(
            "  {} adopted running worker at {}, Ctrl-C to detach",
            green.apply_to("✓"),
            status.base_url
        ),
    }

    cancel.cancelled().await;
    supervisor.stop().await;
    Ok(())
}

async fn probe(config: &AppConfig) -> Result<()> {
    let base_url = config.worker.base_url();
    let client = BridgeClient::attached(base_url.clone(), config.worker.connect_timeout())?;
    if !client.probe().await {
        bail!("no worker answering at {base_url}");
    }
    println!(
        "  {} worker answering at {base_url}",
        Style::new().green().bold().apply_to("✓")
    );
    Ok(())
}
