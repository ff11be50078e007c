//! Building the worker command line and forwarding its output.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{LaunchMode, WorkerConfig};

pub(crate) fn build_command(config: &WorkerConfig) -> Command {
    let mut cmd = match config.mode {
        LaunchMode::Development => {
            let mut cmd = Command::new(&config.interpreter);
            cmd.arg(&config.script);
            cmd
        }
        LaunchMode::Packaged => Command::new(&config.binary),
    };
    cmd.arg("--port")
        .arg(config.port.to_string())
        .args(&config.extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Human-readable command line, for logs and error messages.
pub(crate) fn describe(config: &WorkerConfig) -> String {
    let cmd = build_command(config);
    let std_cmd = cmd.as_std();
    let mut parts = vec![std_cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(std_cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Re-emits the child's stdout (info) and stderr (warn) under the `worker`
/// target, one event per line.
pub(crate) fn forward_output(child: &mut Child) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        tasks.push(tokio::spawn(forward_lines(stdout, false)));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(tokio::spawn(forward_lines(stderr, true)));
    }
    tasks
}

async fn forward_lines<R>(reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => tracing::warn!(target: "worker", "{line}"),
            Ok(Some(line)) => tracing::info!(target: "worker", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "worker output stream closed");
                break;
            }
        }
    }
}
