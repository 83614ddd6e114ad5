//! Shared test fixtures: an in-memory multiplexer fake and daemon wiring.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use remux::config::DaemonConfig;
use remux::mux::{Mux, NamedKey, OutputReader};

/// A multiplexer double: sessions live in memory, pane output is fed by the
/// test through a channel, and every side effect is recorded.
#[derive(Default)]
pub struct FakeMux {
    alive: Mutex<HashSet<String>>,
    feeders: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
    screen: Mutex<Vec<u8>>,
    cursor: Mutex<(u16, u16)>,
    pub captures: AtomicUsize,
    sent: Mutex<Vec<(String, String)>>,
    killed: Mutex<Vec<String>>,
    listed: Mutex<Vec<String>>,
}

impl FakeMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// What the next capture returns.
    pub fn set_screen(&self, bytes: &[u8]) {
        *self.screen.lock().unwrap() = bytes.to_vec();
    }

    pub fn set_cursor(&self, row: u16, col: u16) {
        *self.cursor.lock().unwrap() = (row, col);
    }

    /// Pretend a session exists on the server (rediscovery path).
    pub fn add_alive(&self, name: &str) {
        self.alive.lock().unwrap().insert(name.to_string());
    }

    pub fn drop_alive(&self, name: &str) {
        self.alive.lock().unwrap().remove(name);
    }

    /// Names reported by `list_sessions`.
    pub fn set_listed(&self, names: &[&str]) {
        *self.listed.lock().unwrap() = names.iter().map(|s| s.to_string()).collect();
    }

    /// Feed raw pane output into an attached reader.
    pub async fn feed(&self, name: &str, chunk: &[u8]) {
        let tx = self
            .feeders
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .expect("no attached reader for session");
        tx.send(chunk.to_vec()).await.expect("reader gone");
    }

    /// Close the reader stream without killing the session.
    pub fn close_reader(&self, name: &str) {
        self.feeders.lock().unwrap().remove(name);
    }

    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Everything sent with send-keys, in order, as `literal:`/`key:` pairs.
    pub fn sent_keys(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn killed_sessions(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mux for FakeMux {
    async fn create(
        &self,
        name: &str,
        _cols: u16,
        _rows: u16,
        cwd: &Path,
        _argv: &[String],
    ) -> Result<()> {
        if !cwd.is_dir() {
            bail!("no such directory: {}", cwd.display());
        }
        self.alive.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn apply_options(&self, _name: &str) {}

    async fn attach_reader(&self, name: &str) -> Result<OutputReader> {
        if !self.alive.lock().unwrap().contains(name) {
            bail!("session not alive: {name}");
        }
        let (tx, rx) = mpsc::channel(64);
        self.feeders.lock().unwrap().insert(name.to_string(), tx);
        Ok(OutputReader::from_channel(rx))
    }

    async fn detach_reader(&self, name: &str) {
        self.feeders.lock().unwrap().remove(name);
    }

    async fn send_literal(&self, name: &str, text: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((name.to_string(), format!("literal:{text}")));
    }

    async fn send_named(&self, name: &str, key: NamedKey) {
        self.sent
            .lock()
            .unwrap()
            .push((name.to_string(), format!("key:{}", key.as_tmux())));
    }

    async fn capture_pane(&self, name: &str) -> Vec<u8> {
        if !self.alive.lock().unwrap().contains(name) {
            return Vec::new();
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.screen.lock().unwrap().clone()
    }

    async fn cursor_position(&self, _name: &str) -> (u16, u16) {
        *self.cursor.lock().unwrap()
    }

    async fn read_all_scrollback(&self, name: &str) -> Vec<u8> {
        let mut out = b"[history]\n".to_vec();
        out.extend_from_slice(&self.screen.lock().unwrap());
        let _ = name;
        out
    }

    async fn is_alive(&self, name: &str) -> bool {
        self.alive.lock().unwrap().contains(name)
    }

    async fn kill(&self, name: &str) -> Result<()> {
        if !self.alive.lock().unwrap().remove(name) {
            bail!("session not alive: {name}");
        }
        self.feeders.lock().unwrap().remove(name);
        self.killed.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn resize(&self, name: &str, cols: u16, rows: u16) {
        self.sent
            .lock()
            .unwrap()
            .push((name.to_string(), format!("resize:{cols}x{rows}")));
    }

    async fn list_sessions(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }
}

/// Daemon config tightened for fast tests.
pub fn test_config() -> DaemonConfig {
    DaemonConfig {
        idle_threshold: Duration::from_millis(400),
        capture_debounce: Duration::from_millis(30),
        liveness_interval: Duration::from_millis(100),
        ..DaemonConfig::default()
    }
}

/// Sleep long enough for the debounce window plus scheduling slack.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
