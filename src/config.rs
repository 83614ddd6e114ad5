//! Resolved filesystem paths and daemon configuration.
//!
//! Everything that used to be ambient (config dir, session name prefix) is
//! carried here and passed at construction time.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Prefix for tmux session names managed by this daemon.
pub const SESSION_PREFIX: &str = "remux";

/// Default WebSocket/HTTP port.
pub const DEFAULT_PORT: u16 = 9700;

/// Per-user filesystem layout.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory (database, pid file, log file).
    pub config_dir: PathBuf,
    /// Runtime directory for reader FIFOs.
    pub runtime_dir: PathBuf,
}

impl Paths {
    /// Resolve the default per-user layout.
    pub fn resolve() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("remux");
        let runtime_dir = config_dir.join("run");
        Ok(Self {
            config_dir,
            runtime_dir,
        })
    }

    /// Resolve under an explicit base directory (used by tests).
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let config_dir = base.into();
        let runtime_dir = config_dir.join("run");
        Self {
            config_dir,
            runtime_dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.config_dir.join("remux.db")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.config_dir.join("remux.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.config_dir.join("remux.log")
    }

    /// Create the directories if missing.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("creating {}", self.config_dir.display()))?;
        std::fs::create_dir_all(&self.runtime_dir)
            .with_context(|| format!("creating {}", self.runtime_dir.display()))?;
        Ok(())
    }
}

/// Daemon configuration assembled at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Port the WebSocket/HTTP listener binds on.
    pub port: u16,
    /// tmux session name prefix.
    pub session_prefix: String,
    /// Command used to launch the hosted assistant.
    pub assistant_command: String,
    /// Directory served by the static asset handler, if any.
    pub asset_root: Option<PathBuf>,
    /// Idle threshold for the output classifier.
    pub idle_threshold: Duration,
    /// Trailing debounce window for screen captures.
    pub capture_debounce: Duration,
    /// Interval of the per-session liveness probe.
    pub liveness_interval: Duration,
    /// Model identifiers offered in the capability descriptor.
    pub models: Vec<String>,
    /// Toggleable modes offered in the capability descriptor.
    pub modes: Vec<String>,
    /// Slash commands forwarded verbatim to the assistant.
    pub commands: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            session_prefix: SESSION_PREFIX.to_string(),
            assistant_command: "claude".to_string(),
            asset_root: None,
            idle_threshold: Duration::from_secs(3),
            capture_debounce: Duration::from_millis(30),
            liveness_interval: Duration::from_secs(5),
            models: vec![
                "sonnet".to_string(),
                "opus".to_string(),
                "haiku".to_string(),
            ],
            modes: vec!["plan".to_string(), "auto_accept".to_string()],
            commands: vec![
                "/clear".to_string(),
                "/compact".to_string(),
                "/status".to_string(),
            ],
        }
    }
}

impl DaemonConfig {
    /// tmux session name for a session id.
    pub fn tmux_name(&self, id: &str) -> String {
        format!("{}-{}", self.session_prefix, id)
    }

    /// Inverse of [`tmux_name`]: extract the session id from a tmux session
    /// name, if it carries our prefix.
    pub fn session_id_of<'a>(&self, tmux_name: &'a str) -> Option<&'a str> {
        let rest = tmux_name.strip_prefix(&self.session_prefix)?;
        rest.strip_prefix('-').filter(|id| !id.is_empty())
    }
}
