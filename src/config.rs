//! Configuration loaded from `applyd.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! `APPLYD_WORKER_PORT` and `APPLYD_WORKER_MODE` take precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::quota::{PlanTier, QuotaAccount};

const DEFAULT_CONFIG_FILE: &str = "applyd.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Accounts seeded into the quota ledger at startup.
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
}

/// How the worker executable is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// `<interpreter> <script> --port <port>`
    Development,
    /// `<binary> --port <port>`
    Packaged,
}

impl std::str::FromStr for LaunchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(LaunchMode::Development),
            "packaged" | "production" | "prod" => Ok(LaunchMode::Packaged),
            other => bail!("unknown worker mode: {other}"),
        }
    }
}

/// Launch and readiness parameters for the supervised worker.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_mode")]
    pub mode: LaunchMode,

    /// Interpreter used in development mode.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Script passed to the interpreter in development mode.
    #[serde(default = "default_script")]
    pub script: PathBuf,

    /// Packaged worker executable.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,

    /// Appended after `--port <port>`.
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Delay between two liveness probes while waiting for readiness.
    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,

    /// Probes attempted before giving up.
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,

    /// How long `stop` waits for the child to exit after killing it.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Bound on opening a connection to the worker.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_mode() -> LaunchMode {
    LaunchMode::Development
}

fn default_interpreter() -> String {
    "python".to_string()
}

fn default_script() -> PathBuf {
    PathBuf::from("backend/main.py")
}

fn default_binary() -> PathBuf {
    PathBuf::from("backend/applyd-worker")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_ready_interval_ms() -> u64 {
    1000
}

fn default_ready_attempts() -> u32 {
    30
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            interpreter: default_interpreter(),
            script: default_script(),
            binary: default_binary(),
            extra_args: Vec::new(),
            host: default_host(),
            port: default_port(),
            ready_interval_ms: default_ready_interval_ms(),
            ready_attempts: default_ready_attempts(),
            stop_timeout_ms: default_stop_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl WorkerConfig {
    /// HTTP base URL the worker listens on.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Batch pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Timeout for a single worker call; expiry is a transport failure.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Shortest pause between two jobs of the same session; 0 turns pacing off.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Longest pause; each pause is drawn between `pacing_ms` and this.
    #[serde(default = "default_pacing_max_ms")]
    pub pacing_max_ms: u64,

    /// Progress events buffered before the pipeline blocks.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Greeting sent when message composition is turned off.
    #[serde(default = "default_greeting")]
    pub default_greeting: String,
}

fn default_job_timeout_ms() -> u64 {
    60_000
}

fn default_pacing_ms() -> u64 {
    2000
}

fn default_pacing_max_ms() -> u64 {
    6000
}

fn default_event_buffer() -> usize {
    32
}

fn default_greeting() -> String {
    "Hello, I am very interested in this position and would welcome the chance to join your team."
        .to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            job_timeout_ms: default_job_timeout_ms(),
            pacing_ms: default_pacing_ms(),
            pacing_max_ms: default_pacing_max_ms(),
            event_buffer: default_event_buffer(),
            default_greeting: default_greeting(),
        }
    }
}

impl PipelineSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn pacing_max(&self) -> Duration {
        Duration::from_millis(self.pacing_max_ms)
    }
}

/// An `[[accounts]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSeed {
    pub id: String,

    #[serde(default)]
    pub plan: PlanTier,

    /// Overrides the plan allowance, e.g. to restore a persisted balance.
    #[serde(default)]
    pub remaining: Option<u32>,
}

impl AccountSeed {
    pub fn to_account(&self) -> QuotaAccount {
        let mut account = QuotaAccount::new(self.id.clone(), self.plan);
        if let Some(remaining) = self.remaining {
            account.remaining = remaining;
        }
        account
    }
}

impl AppConfig {
    /// Loads `path`, or `applyd.toml` in the current directory when no path
    /// is given. Only an explicitly requested file is required to exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("APPLYD_WORKER_PORT")
            && !port.is_empty()
        {
            self.worker.port = port
                .parse()
                .with_context(|| format!("APPLYD_WORKER_PORT is not a port: {port}"))?;
        }

        if let Ok(mode) = std::env::var("APPLYD_WORKER_MODE")
            && !mode.is_empty()
        {
            self.worker.mode = mode.parse()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.worker.mode, LaunchMode::Development);
        assert_eq!(config.worker.port, 8765);
        assert_eq!(config.worker.ready_attempts, 30);
        assert_eq!(config.worker.ready_interval(), Duration::from_secs(1));
        assert_eq!(config.worker.base_url(), "http://127.0.0.1:8765");
        assert_eq!(config.pipeline.job_timeout(), Duration::from_secs(60));
        assert_eq!(config.pipeline.event_buffer, 32);
        assert_eq!(config.pipeline.pacing(), Duration::from_secs(2));
        assert_eq!(config.pipeline.pacing_max(), Duration::from_secs(6));
        assert_eq!(config.worker.connect_timeout(), Duration::from_secs(5));
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [worker]
            mode = "packaged"
            binary = "/opt/worker/bin/worker"
            port = 9100

            [pipeline]
            pacing_ms = 0

            [[accounts]]
            id = "alice"
            plan = "basic"

            [[accounts]]
            id = "bob"
            remaining = 2
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker.mode, LaunchMode::Packaged);
        assert_eq!(config.worker.binary, PathBuf::from("/opt/worker/bin/worker"));
        assert_eq!(config.worker.port, 9100);
        assert_eq!(config.worker.interpreter, "python");
        assert_eq!(config.pipeline.pacing(), Duration::ZERO);
        assert_eq!(config.pipeline.job_timeout_ms, 60_000);

        let alice = config.accounts[0].to_account();
        assert_eq!(alice.plan, PlanTier::Basic);
        assert_eq!(alice.remaining, 30);

        let bob = config.accounts[1].to_account();
        assert_eq!(bob.plan, PlanTier::Free);
        assert_eq!(bob.remaining, 2);
    }

    #[test]
    fn load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[worker]\nready_attempts = 3").unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.worker.ready_attempts, 3);
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn launch_mode_from_str() {
        assert_eq!("dev".parse::<LaunchMode>().unwrap(), LaunchMode::Development);
        assert_eq!("Packaged".parse::<LaunchMode>().unwrap(), LaunchMode::Packaged);
        assert!("docker".parse::<LaunchMode>().is_err());
    }
}
