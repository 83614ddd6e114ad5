//! Driver for the external terminal multiplexer (tmux).
//!
//! Every operation shells out to the tmux binary. The multiplexer is the
//! serialization point for per-session terminal state; all calls target a
//! session by exact name. `create` and `kill` failures propagate, everything
//! else degrades to an empty or default result so a transient tmux hiccup
//! never takes a session down.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// History kept per pane, in lines.
const HISTORY_LIMIT: u32 = 10_000;

/// Read buffer for the attach stream.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Named keys tmux understands. Everything outside this set is sent literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedKey {
    CtrlC,
    Escape,
    Enter,
    Tab,
    Backspace,
    Up,
    Down,
    Left,
    Right,
    PageUp,
    PageDown,
}

impl NamedKey {
    /// The key name as tmux `send-keys` expects it.
    pub fn as_tmux(&self) -> &'static str {
        match self {
            NamedKey::CtrlC => "C-c",
            NamedKey::Escape => "Escape",
            NamedKey::Enter => "Enter",
            NamedKey::Tab => "Tab",
            NamedKey::Backspace => "BSpace",
            NamedKey::Up => "Up",
            NamedKey::Down => "Down",
            NamedKey::Left => "Left",
            NamedKey::Right => "Right",
            NamedKey::PageUp => "PPage",
            NamedKey::PageDown => "NPage",
        }
    }
}

/// A decoded client key press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyInput {
    Named(NamedKey),
    Literal(String),
}

/// Map the closed set of raw input encodings to named keys. Any other byte
/// sequence is sent through literally.
pub fn decode_raw_key(raw: &str) -> KeyInput {
    let named = match raw {
        "\x03" => Some(NamedKey::CtrlC),
        "\x1b" => Some(NamedKey::Escape),
        "\r" | "\n" => Some(NamedKey::Enter),
        "\t" => Some(NamedKey::Tab),
        "\x7f" | "\x08" => Some(NamedKey::Backspace),
        "\x1b[A" => Some(NamedKey::Up),
        "\x1b[B" => Some(NamedKey::Down),
        "\x1b[C" => Some(NamedKey::Right),
        "\x1b[D" => Some(NamedKey::Left),
        "\x1b[5~" => Some(NamedKey::PageUp),
        "\x1b[6~" => Some(NamedKey::PageDown),
        _ => None,
    };
    match named {
        Some(key) => KeyInput::Named(key),
        None => KeyInput::Literal(raw.to_string()),
    }
}

/// Stream of raw pane output from a read-only attach.
///
/// The stream ends (yields `None`) when the pipe closes, which happens when
/// the tmux session dies or the reader is detached.
pub struct OutputReader {
    rx: mpsc::Receiver<Vec<u8>>,
    task: Option<JoinHandle<()>>,
}

impl OutputReader {
    /// Wrap a plain channel (used by drivers without a pump task).
    pub fn from_channel(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx, task: None }
    }

    /// Next chunk of raw terminal bytes, escape sequences included.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Drop for OutputReader {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Operations the daemon needs from the external multiplexer.
///
/// `create` and `kill` failures propagate; every other operation tolerates
/// transient failures and degrades to an empty or default result.
#[async_trait]
pub trait Mux: Send + Sync + 'static {
    async fn create(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: &Path,
        argv: &[String],
    ) -> Result<()>;
    async fn apply_options(&self, name: &str);
    async fn attach_reader(&self, name: &str) -> Result<OutputReader>;
    async fn detach_reader(&self, name: &str);
    async fn send_literal(&self, name: &str, text: &str);
    async fn send_named(&self, name: &str, key: NamedKey);
    async fn capture_pane(&self, name: &str) -> Vec<u8>;
    async fn cursor_position(&self, name: &str) -> (u16, u16);
    async fn read_all_scrollback(&self, name: &str) -> Vec<u8>;
    async fn is_alive(&self, name: &str) -> bool;
    async fn kill(&self, name: &str) -> Result<()>;
    async fn resize(&self, name: &str, cols: u16, rows: u16);
    async fn list_sessions(&self) -> Vec<String>;

    /// Send a decoded key press.
    async fn send_key(&self, name: &str, key: &KeyInput) {
        match key {
            KeyInput::Named(k) => self.send_named(name, *k).await,
            KeyInput::Literal(text) => self.send_literal(name, text).await,
        }
    }

    /// Literal text followed by Enter, as two calls.
    async fn send_input_line(&self, name: &str, text: &str) {
        self.send_literal(name, text).await;
        self.send_named(name, NamedKey::Enter).await;
    }
}

/// Client for the tmux binary.
#[derive(Debug, Clone)]
pub struct TmuxDriver {
    tmux_path: String,
    runtime_dir: PathBuf,
}

impl TmuxDriver {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmux_path: "tmux".to_string(),
            runtime_dir: runtime_dir.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.tmux_path);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Exact-match target for a session name.
    fn target(name: &str) -> String {
        format!("={name}")
    }

    fn fifo_path(&self, name: &str) -> PathBuf {
        self.runtime_dir.join(format!("{name}.pipe"))
    }

    async fn run_tolerant(&self, args: &[&str]) -> Result<()> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawning tmux {}", args.first().unwrap_or(&"")))?;
        if !output.status.success() {
            bail!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn run_for_bytes(&self, args: &[&str]) -> Option<Vec<u8>> {
        match self.command().args(args).output().await {
            Ok(output) if output.status.success() => Some(output.stdout),
            Ok(output) => {
                debug!(
                    "tmux {} failed: {}",
                    args.first().unwrap_or(&""),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                debug!("tmux {} failed to spawn: {e}", args.first().unwrap_or(&""));
                None
            }
        }
    }
}

#[async_trait]
impl Mux for TmuxDriver {
    /// Start a new detached session running `argv` and apply our options.
    async fn create(
        &self,
        name: &str,
        cols: u16,
        rows: u16,
        cwd: &Path,
        argv: &[String],
    ) -> Result<()> {
        let cols = cols.to_string();
        let rows = rows.to_string();
        let mut cmd = self.command();
        cmd.args(["new-session", "-d", "-s", name])
            .args(["-x", cols.as_str(), "-y", rows.as_str()])
            .arg("-c")
            .arg(cwd)
            .arg("--")
            .args(argv);

        let output = cmd.output().await.context("spawning tmux new-session")?;
        if !output.status.success() {
            bail!(
                "tmux new-session failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        self.apply_options(name).await;
        Ok(())
    }

    /// Apply session options. Idempotent; used both on create and when
    /// re-attaching to a session that survived a daemon restart.
    async fn apply_options(&self, name: &str) {
        let target = Self::target(name);
        let history = HISTORY_LIMIT.to_string();
        let option_sets: [&[&str]; 4] = [
            &["set-option", "-t", &target, "status", "off"],
            &["set-option", "-w", "-t", &target, "window-size", "largest"],
            &["set-option", "-t", &target, "mouse", "on"],
            &["set-option", "-t", &target, "history-limit", &history],
        ];

        for args in option_sets {
            if let Err(e) = self.run_tolerant(args).await {
                debug!("tmux set-option failed for {name}: {e}");
            }
        }
    }

    /// Attach to the session's output in read-only fashion.
    ///
    /// Pipes pane output into a per-session FIFO and streams the FIFO back.
    /// The stream ends out-of-band when the pane (or tmux itself) goes away.
    async fn attach_reader(&self, name: &str) -> Result<OutputReader> {
        let fifo = self.fifo_path(name);
        if fifo.exists() {
            let _ = std::fs::remove_file(&fifo);
        }
        mkfifo(&fifo).with_context(|| format!("creating fifo {}", fifo.display()))?;

        // The open below parks on the blocking pool until tmux's side of the
        // pipe shows up, so the reader task must exist before pipe-pane runs.
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        let fifo_for_task = fifo.clone();
        let task = tokio::spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .read(true)
                .open(&fifo_for_task)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!("opening reader fifo failed: {e}");
                    return;
                }
            };
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match file.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let pipe_cmd = format!("cat >> '{}'", fifo.display());
        let target = Self::target(name);
        if let Err(e) = self
            .run_tolerant(&["pipe-pane", "-t", &target, "-o", &pipe_cmd])
            .await
        {
            task.abort();
            let _ = std::fs::remove_file(&fifo);
            return Err(e).context("starting pipe-pane");
        }

        Ok(OutputReader {
            rx,
            task: Some(task),
        })
    }

    /// Stop the read-only attach for a session.
    async fn detach_reader(&self, name: &str) {
        let target = Self::target(name);
        // pipe-pane with no command closes the existing pipe.
        if let Err(e) = self.run_tolerant(&["pipe-pane", "-t", &target]).await {
            debug!("pipe-pane close failed for {name}: {e}");
        }
        let _ = std::fs::remove_file(self.fifo_path(name));
    }

    /// Send literal text, verbatim, no key-name interpretation.
    async fn send_literal(&self, name: &str, text: &str) {
        let target = Self::target(name);
        if let Err(e) = self
            .run_tolerant(&["send-keys", "-t", &target, "-l", "--", text])
            .await
        {
            warn!("send-keys (literal) failed for {name}: {e}");
        }
    }

    /// Send a named key.
    async fn send_named(&self, name: &str, key: NamedKey) {
        let target = Self::target(name);
        if let Err(e) = self
            .run_tolerant(&["send-keys", "-t", &target, key.as_tmux()])
            .await
        {
            warn!("send-keys ({}) failed for {name}: {e}", key.as_tmux());
        }
    }

    /// Capture the full current pane, colors included. Rows are LF-terminated.
    async fn capture_pane(&self, name: &str) -> Vec<u8> {
        let target = Self::target(name);
        self.run_for_bytes(&["capture-pane", "-p", "-e", "-t", &target])
            .await
            .unwrap_or_default()
    }

    /// Current cursor position, 0-based. Best effort.
    async fn cursor_position(&self, name: &str) -> (u16, u16) {
        let target = Self::target(name);
        let out = self
            .run_for_bytes(&[
                "display-message",
                "-p",
                "-t",
                &target,
                "#{cursor_y} #{cursor_x}",
            ])
            .await
            .unwrap_or_default();
        let text = String::from_utf8_lossy(&out);
        let mut parts = text.split_whitespace();
        let row = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let col = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        (row, col)
    }

    /// The entire history buffer plus the visible pane.
    async fn read_all_scrollback(&self, name: &str) -> Vec<u8> {
        let target = Self::target(name);
        self.run_for_bytes(&["capture-pane", "-p", "-e", "-S", "-", "-t", &target])
            .await
            .unwrap_or_default()
    }

    /// Liveness probe.
    async fn is_alive(&self, name: &str) -> bool {
        let target = Self::target(name);
        self.command()
            .args(["has-session", "-t", target.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Terminate the session. Failure propagates.
    async fn kill(&self, name: &str) -> Result<()> {
        let target = Self::target(name);
        let output = self
            .command()
            .args(["kill-session", "-t", &target])
            .output()
            .await
            .context("spawning tmux kill-session")?;
        if !output.status.success() {
            bail!(
                "tmux kill-session failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let _ = std::fs::remove_file(self.fifo_path(name));
        Ok(())
    }

    /// Resize the session's window.
    async fn resize(&self, name: &str, cols: u16, rows: u16) {
        let target = Self::target(name);
        if let Err(e) = self
            .run_tolerant(&[
                "resize-window",
                "-t",
                &target,
                "-x",
                &cols.to_string(),
                "-y",
                &rows.to_string(),
            ])
            .await
        {
            debug!("resize-window failed for {name}: {e}");
        }
    }

    /// All session names known to the tmux server. Empty when no server runs.
    async fn list_sessions(&self) -> Vec<String> {
        let output = match self
            .command()
            .args(["list-sessions", "-F", "#{session_name}"])
            .output()
            .await
        {
            Ok(o) => o,
            Err(e) => {
                debug!("tmux list-sessions failed to spawn: {e}");
                return Vec::new();
            }
        };

        if !output.status.success() {
            // A missing server is the normal cold-start case, not an error.
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("no server running") && !stderr.contains("no sessions") {
                debug!("tmux list-sessions failed: {}", stderr.trim());
            }
            return Vec::new();
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

fn mkfifo(path: &Path) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encodings_map_to_named_keys() {
        assert_eq!(decode_raw_key("\x03"), KeyInput::Named(NamedKey::CtrlC));
        assert_eq!(decode_raw_key("\x1b"), KeyInput::Named(NamedKey::Escape));
        assert_eq!(decode_raw_key("\r"), KeyInput::Named(NamedKey::Enter));
        assert_eq!(decode_raw_key("\n"), KeyInput::Named(NamedKey::Enter));
        assert_eq!(decode_raw_key("\t"), KeyInput::Named(NamedKey::Tab));
        assert_eq!(decode_raw_key("\x7f"), KeyInput::Named(NamedKey::Backspace));
        assert_eq!(decode_raw_key("\x1b[A"), KeyInput::Named(NamedKey::Up));
        assert_eq!(decode_raw_key("\x1b[B"), KeyInput::Named(NamedKey::Down));
        assert_eq!(decode_raw_key("\x1b[C"), KeyInput::Named(NamedKey::Right));
        assert_eq!(decode_raw_key("\x1b[D"), KeyInput::Named(NamedKey::Left));
        assert_eq!(decode_raw_key("\x1b[5~"), KeyInput::Named(NamedKey::PageUp));
        assert_eq!(
            decode_raw_key("\x1b[6~"),
            KeyInput::Named(NamedKey::PageDown)
        );
    }

    #[test]
    fn everything_else_is_literal() {
        assert_eq!(
            decode_raw_key("hello"),
            KeyInput::Literal("hello".to_string())
        );
        // Unrecognized escape sequences fall through literally too.
        assert_eq!(
            decode_raw_key("\x1b[H"),
            KeyInput::Literal("\x1b[H".to_string())
        );
        assert_eq!(decode_raw_key("y"), KeyInput::Literal("y".to_string()));
    }
}
