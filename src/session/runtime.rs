//! Live session runtime.
//!
//! A `Session` owns one tmux session, its read-only output stream, its
//! classifier, and the debounced capture pipeline. All mutable state sits
//! behind per-session locks; events leave through the registry-wide
//! broadcast channel.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::classify::{Classification, Classifier, InputKind};
use crate::config::DaemonConfig;
use crate::mux::{KeyInput, Mux};
use crate::session::models::{now_rfc3339, SessionKind, SessionRecord, SessionState, SessionSnapshot};
use crate::session::registry::SessionEvent;
use crate::session::repository::SessionRepository;

/// Delay before the forced capture that follows a resize, giving the hosted
/// TUI time to re-render after the window-change signal.
const RESIZE_CAPTURE_DELAY: Duration = Duration::from_millis(150);

/// Signals into the capture pipeline.
enum Trigger {
    Activity,
}

/// Screen-emission state, authoritative inside the session only.
#[derive(Default)]
struct ScreenState {
    last_emitted: Option<String>,
    has_received_resize: bool,
}

/// One live session.
pub struct Session {
    record: Mutex<SessionRecord>,
    tmux_name: String,
    driver: Arc<dyn Mux>,
    repo: SessionRepository,
    config: DaemonConfig,
    events: broadcast::Sender<SessionEvent>,
    screen: Mutex<ScreenState>,
    capture_in_flight: AtomicBool,
    trigger_tx: Mutex<Option<mpsc::UnboundedSender<Trigger>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        record: SessionRecord,
        driver: Arc<dyn Mux>,
        repo: SessionRepository,
        config: DaemonConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let tmux_name = config.tmux_name(&record.id);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            record: Mutex::new(record),
            tmux_name,
            driver,
            repo,
            config,
            events,
            screen: Mutex::new(ScreenState::default()),
            capture_in_flight: AtomicBool::new(false),
            trigger_tx: Mutex::new(None),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn id(&self) -> String {
        self.record.lock().await.id.clone()
    }

    pub fn tmux_name(&self) -> &str {
        &self.tmux_name
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::from(&*self.record.lock().await)
    }

    pub async fn state(&self) -> SessionState {
        self.record.lock().await.state
    }

    /// Argv for the hosted process.
    async fn build_argv(&self) -> Vec<String> {
        let record = self.record.lock().await;
        match record.session_type {
            SessionKind::Assistant => {
                let mut argv = vec![self.config.assistant_command.clone()];
                if let Some(model) = &record.model {
                    argv.push("--model".to_string());
                    argv.push(model.clone());
                }
                if record.plan_mode {
                    argv.push("--plan".to_string());
                }
                if record.auto_accept {
                    argv.push("--dangerously-skip-permissions".to_string());
                }
                argv
            }
            SessionKind::Shell => {
                vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())]
            }
        }
    }

    /// Fresh start: create the tmux session, apply options, attach the
    /// reader, and go idle. A create failure is fatal to session start.
    pub async fn start_fresh(self: &Arc<Self>) -> Result<()> {
        let (cols, rows, project) = {
            let record = self.record.lock().await;
            (
                record.cols as u16,
                record.rows as u16,
                record.project_path.clone(),
            )
        };
        let argv = self.build_argv().await;

        self.driver
            .create(&self.tmux_name, cols, rows, Path::new(&project), &argv)
            .await
            .with_context(|| format!("creating tmux session {}", self.tmux_name))?;

        self.attach_pipeline().await?;
        self.set_state(SessionState::Idle).await;
        Ok(())
    }

    /// Attach to a tmux session that already exists (daemon restart path).
    /// Returns false when the session is not alive anymore.
    pub async fn attach_existing(self: &Arc<Self>) -> Result<bool> {
        if !self.driver.is_alive(&self.tmux_name).await {
            return Ok(false);
        }
        self.driver.apply_options(&self.tmux_name).await;
        self.attach_pipeline().await?;
        self.set_state(SessionState::Idle).await;
        Ok(true)
    }

    /// Record a fatal start failure.
    pub async fn mark_error(&self) {
        self.set_state(SessionState::Error).await;
    }

    /// Spawn reader, capture, and liveness tasks.
    async fn attach_pipeline(self: &Arc<Self>) -> Result<()> {
        let reader = self
            .driver
            .attach_reader(&self.tmux_name)
            .await
            .with_context(|| format!("attaching reader to {}", self.tmux_name))?;

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        *self.trigger_tx.lock().await = Some(trigger_tx.clone());

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).reader_loop(reader, trigger_tx)));
        tasks.push(tokio::spawn(Arc::clone(self).capture_loop(trigger_rx)));
        tasks.push(tokio::spawn(Arc::clone(self).liveness_loop()));
        Ok(())
    }

    /// Reader: raw bytes -> classifier -> state machine + capture triggers.
    /// Also owns the idle timer.
    async fn reader_loop(
        self: Arc<Self>,
        mut reader: crate::mux::OutputReader,
        trigger_tx: mpsc::UnboundedSender<Trigger>,
    ) {
        let mut classifier = Classifier::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut idle_deadline: Option<Instant> = None;

        loop {
            let idle_at = idle_deadline;
            let idle_sleep = async move {
                match idle_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = idle_sleep => {
                    idle_deadline = None;
                    self.on_possibly_idle().await;
                }
                chunk = reader.next_chunk() => {
                    let Some(chunk) = chunk else {
                        // Out-of-band stream end: the pane or tmux went away.
                        if !self.driver.is_alive(&self.tmux_name).await {
                            self.mark_dead().await;
                        } else {
                            debug!("reader pipe for {} closed while session alive", self.tmux_name);
                        }
                        break;
                    };

                    // Every chunk is activity, whatever the classifier says.
                    self.touch_activity().await;
                    let _ = trigger_tx.send(Trigger::Activity);
                    idle_deadline = Some(Instant::now() + self.config.idle_threshold);

                    if let Some(classification) = classifier.ingest(&chunk) {
                        self.apply_classification(classification, classifier.window())
                            .await;
                    }
                }
            }
        }
    }

    /// Capture pipeline: trailing debounce, at most one capture in flight.
    async fn capture_loop(self: Arc<Self>, mut trigger_rx: mpsc::UnboundedReceiver<Trigger>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut deadline: Option<Instant> = None;

        loop {
            let due = deadline;
            let debounce_sleep = async move {
                match due {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                trigger = trigger_rx.recv() => {
                    match trigger {
                        Some(Trigger::Activity) => {
                            deadline = Some(Instant::now() + self.config.capture_debounce);
                        }
                        None => break,
                    }
                }
                _ = debounce_sleep => {
                    deadline = None;
                    self.capture_now().await;
                }
            }
        }
    }

    /// Periodic liveness probe.
    async fn liveness_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.liveness_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    if self.state().await.is_terminal() {
                        break;
                    }
                    if !self.driver.is_alive(&self.tmux_name).await {
                        self.mark_dead().await;
                        break;
                    }
                }
            }
        }
    }

    async fn on_possibly_idle(&self) {
        if self.state().await == SessionState::Working {
            self.set_state(SessionState::Idle).await;
        }
    }

    async fn apply_classification(&self, classification: Classification, window: &str) {
        match classification {
            Classification::Working => {
                self.set_state(SessionState::Working).await;
            }
            Classification::InputRequired {
                kind,
                question,
                options,
            } => {
                let next = match kind {
                    InputKind::Confirmation => SessionState::AwaitingConfirmation,
                    _ => SessionState::AwaitingInput,
                };
                self.set_state(next).await;
                let id = self.id().await;
                let _ = self.events.send(SessionEvent::InputRequired {
                    session_id: id,
                    input_type: kind,
                    context: window.to_string(),
                    question,
                    options,
                    timestamp: now_rfc3339(),
                });
            }
            Classification::ContextExhausted { window } => {
                self.set_state(SessionState::ContextLimit).await;
                let id = self.id().await;
                let _ = self.events.send(SessionEvent::ContextLimit {
                    session_id: id,
                    message: window,
                });
            }
        }
    }

    async fn touch_activity(&self) {
        self.record.lock().await.updated_at = now_rfc3339();
    }

    /// Serialized state transition. Terminal states are never left; repeated
    /// transitions to the current state emit nothing.
    async fn set_state(&self, next: SessionState) {
        let snapshot = {
            let mut record = self.record.lock().await;
            if record.state.is_terminal() || record.state == next {
                return;
            }
            record.state = next;
            record.updated_at = now_rfc3339();
            if next == SessionState::Dead {
                record.ended_at = Some(record.updated_at.clone());
            }
            SessionSnapshot::from(&*record)
        };

        let result = if next == SessionState::Dead {
            self.repo.mark_ended(&snapshot.id).await
        } else {
            self.repo.update_state(&snapshot.id, next).await
        };
        if let Err(e) = result {
            warn!("persisting state for {}: {e:#}", snapshot.id);
        }

        let _ = self.events.send(SessionEvent::Updated {
            session: snapshot,
        });
    }

    /// Transition to dead and fire the exit event.
    pub async fn mark_dead(&self) {
        let was_terminal = self.state().await.is_terminal();
        self.set_state(SessionState::Dead).await;
        if !was_terminal {
            let id = self.id().await;
            info!("session {id} is dead");
            let _ = self.events.send(SessionEvent::Exit { session_id: id });
        }
    }

    /// One debounced capture: pane + cursor, post-process, emit if changed.
    async fn capture_now(&self) {
        {
            let screen = self.screen.lock().await;
            if !screen.has_received_resize {
                return;
            }
        }
        if self.capture_in_flight.swap(true, Ordering::AcqRel) {
            // An earlier capture is still running; the next trigger retries.
            return;
        }

        let raw = self.driver.capture_pane(&self.tmux_name).await;
        if raw.is_empty() {
            self.capture_in_flight.store(false, Ordering::Release);
            return;
        }
        let (row, col) = self.driver.cursor_position(&self.tmux_name).await;
        let processed = postprocess_screen(&raw, row, col);

        let changed = {
            let mut screen = self.screen.lock().await;
            if screen.last_emitted.as_deref() == Some(processed.as_str()) {
                false
            } else {
                screen.last_emitted = Some(processed.clone());
                true
            }
        };
        self.capture_in_flight.store(false, Ordering::Release);

        if changed {
            let id = self.id().await;
            let _ = self.events.send(SessionEvent::Output {
                session_id: id,
                content: processed,
            });
        }
    }

    /// Apply a client viewport. Clears the emitted-screen cache and forces a
    /// capture once the hosted TUI had a chance to redraw.
    pub async fn resize(self: &Arc<Self>, cols: u16, rows: u16) {
        self.driver.resize(&self.tmux_name, cols, rows).await;
        {
            let mut record = self.record.lock().await;
            record.cols = cols as i64;
            record.rows = rows as i64;
        }
        if let Err(e) = self.repo.update_size(&self.id().await, cols, rows).await {
            warn!("persisting size: {e:#}");
        }
        {
            let mut screen = self.screen.lock().await;
            screen.has_received_resize = true;
            screen.last_emitted = None;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RESIZE_CAPTURE_DELAY).await;
            if let Some(tx) = &*this.trigger_tx.lock().await {
                let _ = tx.send(Trigger::Activity);
            }
        });
    }

    /// Update the mode flags on the in-memory record.
    pub async fn set_modes(&self, plan_mode: bool, auto_accept: bool) {
        let mut record = self.record.lock().await;
        record.plan_mode = plan_mode;
        record.auto_accept = auto_accept;
        record.updated_at = now_rfc3339();
    }

    /// Current viewport as (cols, rows).
    pub async fn size(&self) -> (u16, u16) {
        let record = self.record.lock().await;
        (record.cols as u16, record.rows as u16)
    }

    /// Literal text plus Enter. Assistant sessions optimistically go to
    /// `working`; the classifier corrects us if the prompt never ran.
    pub async fn send_input_line(&self, text: &str) -> Result<()> {
        self.ensure_live().await?;
        self.driver.send_input_line(&self.tmux_name, text).await;
        if self.record.lock().await.session_type == SessionKind::Assistant {
            self.set_state(SessionState::Working).await;
        }
        Ok(())
    }

    /// One decoded key press.
    pub async fn send_key(&self, key: &KeyInput) -> Result<()> {
        self.ensure_live().await?;
        self.driver.send_key(&self.tmux_name, key).await;
        Ok(())
    }

    /// The whole history buffer, verbatim.
    pub async fn scrollback(&self) -> String {
        String::from_utf8_lossy(&self.driver.read_all_scrollback(&self.tmux_name).await)
            .into_owned()
    }

    /// Post-processed view of the current screen, for pull-style requests.
    pub async fn current_screen(&self, lines: Option<usize>) -> String {
        let cached = self.screen.lock().await.last_emitted.clone();
        let screen = match cached {
            Some(s) => s,
            None => {
                let raw = self.driver.capture_pane(&self.tmux_name).await;
                let (row, col) = self.driver.cursor_position(&self.tmux_name).await;
                postprocess_screen(&raw, row, col)
            }
        };
        match lines {
            Some(n) => {
                let all: Vec<&str> = screen.lines().collect();
                let start = all.len().saturating_sub(n);
                all[start..].join("\n")
            }
            None => screen,
        }
    }

    /// Last `rows` rows of the visible pane, for restart handoff.
    pub async fn recent_output(&self, rows: usize) -> String {
        let raw = self.driver.capture_pane(&self.tmux_name).await;
        let text = String::from_utf8_lossy(&raw);
        let lines: Vec<&str> = text.lines().map(|l| l.trim_end()).collect();
        let trimmed: Vec<&str> = {
            let mut v = lines;
            while v.last().is_some_and(|l| l.is_empty()) {
                v.pop();
            }
            v
        };
        let start = trimmed.len().saturating_sub(rows);
        trimmed[start..].join("\n")
    }

    /// Stop reader and timers without killing the tmux session.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.driver.detach_reader(&self.tmux_name).await;
    }

    async fn ensure_live(&self) -> Result<()> {
        let state = self.state().await;
        if state.is_terminal() || state == SessionState::Starting {
            anyhow::bail!("session is not live (state: {state})");
        }
        Ok(())
    }
}

/// Trim trailing whitespace per row, strip trailing empty rows, append the
/// cursor-position escape.
pub fn postprocess_screen(raw: &[u8], cursor_row: u16, cursor_col: u16) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut rows: Vec<&str> = text.lines().map(|l| l.trim_end()).collect();
    while rows.last().is_some_and(|l| l.is_empty()) {
        rows.pop();
    }
    let mut out = rows.join("\n");
    out.push_str(&cursor_escape(cursor_row, cursor_col));
    out
}

/// 1-based cursor-position escape for a 0-based position.
pub fn cursor_escape(row: u16, col: u16) -> String {
    format!("\x1b[{};{}H", row as u32 + 1, col as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postprocess_trims_rows_and_appends_cursor() {
        let raw = b"hello   \nworld\t \n\n   \n";
        let got = postprocess_screen(raw, 1, 4);
        assert_eq!(got, "hello\nworld\x1b[2;5H");
    }

    #[test]
    fn postprocess_of_identical_screens_is_stable() {
        let a = postprocess_screen(b"a\nb\n", 0, 0);
        let b = postprocess_screen(b"a\nb\n", 0, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn cursor_escape_is_one_based() {
        assert_eq!(cursor_escape(0, 0), "\x1b[1;1H");
        assert_eq!(cursor_escape(23, 79), "\x1b[24;80H");
    }
}
