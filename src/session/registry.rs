//! Session registry: exclusive owner of live sessions.
//!
//! Other components refer to sessions by id and go through the registry for
//! every cross-call, which keeps the registry <-> session <-> hub triangle
//! free of reference cycles.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use tokio::sync::{broadcast, RwLock};

use crate::classify::InputKind;
use crate::config::DaemonConfig;
use crate::mux::Mux;
use crate::session::models::{
    generate_session_id, CreateSessionParams, SessionKind, SessionRecord, SessionSnapshot,
};
use crate::session::repository::SessionRepository;
use crate::session::runtime::Session;

/// Rows of pane output carried into a restarted session.
const RESTART_SUMMARY_ROWS: usize = 40;

/// Grace period before the continuation prompt is sent to a restarted
/// session, so the assistant is past its own startup.
const RESTART_PROMPT_GRACE: Duration = Duration::from_secs(2);

/// Broadcast buffer for session events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Typed events published by sessions and the registry; the hub subscribes.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Created {
        session: SessionSnapshot,
    },
    Updated {
        session: SessionSnapshot,
    },
    Killed {
        session_id: String,
    },
    Output {
        session_id: String,
        content: String,
    },
    InputRequired {
        session_id: String,
        input_type: InputKind,
        context: String,
        question: String,
        options: Option<Vec<String>>,
        timestamp: String,
    },
    ContextLimit {
        session_id: String,
        message: String,
    },
    Exit {
        session_id: String,
    },
}

/// Maps session id -> live session; persists and rediscovers records.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    repo: SessionRepository,
    driver: Arc<dyn Mux>,
    config: DaemonConfig,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(repo: SessionRepository, driver: Arc<dyn Mux>, config: DaemonConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            repo,
            driver,
            config,
            events,
        })
    }

    /// Subscribe to the session event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Snapshots of every live session, newest first.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.snapshot().await);
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Create and start a new session.
    pub async fn create_session(
        self: &Arc<Self>,
        params: CreateSessionParams,
    ) -> Result<SessionSnapshot> {
        let kind = match params.session_type.as_deref() {
            None | Some("assistant") => SessionKind::Assistant,
            Some("shell") => SessionKind::Shell,
            Some(other) => bail!("unknown session type: {other}"),
        };

        let project = Path::new(&params.project_path);
        if !project.is_absolute() {
            bail!("project path must be absolute: {}", params.project_path);
        }
        if !project.is_dir() {
            bail!("project path does not exist: {}", params.project_path);
        }

        let id = generate_session_id();
        let model = match kind {
            SessionKind::Assistant => params.model,
            SessionKind::Shell => None,
        };
        let record = SessionRecord::new(
            id.clone(),
            kind,
            params.project_path.clone(),
            model,
            params.plan_mode,
        );
        self.repo.insert(&record).await?;

        let session = Session::new(
            record,
            self.driver.clone(),
            self.repo.clone(),
            self.config.clone(),
            self.events.clone(),
        );

        if let Err(e) = session.start_fresh().await {
            session.mark_error().await;
            return Err(e).context("starting session");
        }

        self.sessions.write().await.insert(id.clone(), session.clone());
        let snapshot = session.snapshot().await;
        info!("created session {id} in {}", snapshot.project_path);
        let _ = self.events.send(SessionEvent::Created {
            session: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Kill a session's tmux backing and retire its record.
    pub async fn kill_session(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .with_context(|| format!("unknown session: {id}"))?;

        session.disconnect().await;
        self.driver.kill(session.tmux_name()).await?;
        self.repo.mark_ended(id).await?;
        info!("killed session {id}");
        let _ = self.events.send(SessionEvent::Killed {
            session_id: id.to_string(),
        });
        Ok(())
    }

    /// Restart a session in place, optionally carrying recent output into
    /// the new instance as continuation context.
    pub async fn restart_session(
        self: &Arc<Self>,
        id: &str,
        with_summary: bool,
        new_model: Option<String>,
    ) -> Result<SessionSnapshot> {
        let old = self
            .get(id)
            .await
            .with_context(|| format!("unknown session: {id}"))?;

        let summary = if with_summary {
            let text = old.recent_output(RESTART_SUMMARY_ROWS).await;
            if text.trim().is_empty() {
                None
            } else {
                Some(text)
            }
        } else {
            None
        };

        let mut record = {
            let snapshot = old.snapshot().await;
            let mut r = SessionRecord::new(
                snapshot.id.clone(),
                snapshot.session_type,
                snapshot.project_path.clone(),
                new_model.clone().or(snapshot.model),
                snapshot.plan_mode,
            );
            r.auto_accept = snapshot.auto_accept;
            r.cols = snapshot.cols as i64;
            r.rows = snapshot.rows as i64;
            r.created_at = snapshot.created_at;
            r
        };

        old.disconnect().await;
        self.driver.kill(old.tmux_name()).await?;
        self.sessions.write().await.remove(id);

        if let Some(model) = &new_model {
            self.repo.update_model(id, Some(model)).await?;
        }
        if let Some(summary) = &summary {
            self.repo.update_summary(id, summary).await?;
            record.summary = Some(summary.clone());
        }
        self.repo
            .update_state(id, crate::session::models::SessionState::Starting)
            .await?;

        let session = Session::new(
            record,
            self.driver.clone(),
            self.repo.clone(),
            self.config.clone(),
            self.events.clone(),
        );
        if let Err(e) = session.start_fresh().await {
            session.mark_error().await;
            return Err(e).context("restarting session");
        }
        self.sessions.write().await.insert(id.to_string(), session.clone());

        let snapshot = session.snapshot().await;
        let _ = self.events.send(SessionEvent::Updated {
            session: snapshot.clone(),
        });

        if let Some(summary) = summary {
            let session = session.clone();
            tokio::spawn(async move {
                tokio::time::sleep(RESTART_PROMPT_GRACE).await;
                let prompt = format!(
                    "Continuing from a restarted session. Recent terminal output:\n\n{summary}"
                );
                if let Err(e) = session.send_input_line(&prompt).await {
                    warn!("sending continuation prompt: {e:#}");
                }
            });
        }

        info!("restarted session {id}");
        Ok(snapshot)
    }

    /// Flip a mode flag on a session's record.
    pub async fn toggle_mode(&self, id: &str, mode: &str, enabled: bool) -> Result<SessionSnapshot> {
        let session = self
            .get(id)
            .await
            .with_context(|| format!("unknown session: {id}"))?;

        let snapshot = session.snapshot().await;
        let (plan_mode, auto_accept) = match mode {
            "plan" => (enabled, snapshot.auto_accept),
            "auto_accept" => (snapshot.plan_mode, enabled),
            other => bail!("unknown mode: {other}"),
        };
        self.repo.update_modes(id, plan_mode, auto_accept).await?;
        session.set_modes(plan_mode, auto_accept).await;

        let snapshot = session.snapshot().await;
        let _ = self.events.send(SessionEvent::Updated {
            session: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Reconnect to sessions that survived a daemon restart.
    ///
    /// After this runs, the registry's ids equal the alive tmux sessions
    /// carrying our prefix, and every open row without a live session is
    /// marked ended.
    pub async fn rediscover(self: &Arc<Self>) -> Result<()> {
        let names = self.driver.list_sessions().await;
        let mut found: HashSet<String> = HashSet::new();

        for name in names {
            let Some(id) = self.config.session_id_of(&name) else {
                continue;
            };
            let id = id.to_string();

            let (record, known) = match self.repo.get(&id).await? {
                Some(mut record) => {
                    record.state = crate::session::models::SessionState::Starting;
                    record.ended_at = None;
                    (record, true)
                }
                None => {
                    // A session we host but have no row for; synthesize the
                    // minimal config so it stays manageable.
                    let cwd = std::env::current_dir()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| "/".to_string());
                    (
                        SessionRecord::new(id.clone(), SessionKind::Assistant, cwd, None, false),
                        false,
                    )
                }
            };

            // The row has to exist before the session starts persisting
            // state transitions through it.
            if !known {
                self.repo.insert(&record).await?;
            }

            let session = Session::new(
                record,
                self.driver.clone(),
                self.repo.clone(),
                self.config.clone(),
                self.events.clone(),
            );
            match session.attach_existing().await {
                Ok(true) => {
                    self.sessions.write().await.insert(id.clone(), session.clone());
                    found.insert(id.clone());
                    let snapshot = session.snapshot().await;
                    info!("re-attached session {id}");
                    let _ = self.events.send(SessionEvent::Created { session: snapshot });
                }
                Ok(false) => {
                    info!("session {id} found dead during rediscovery");
                    self.repo.mark_ended(&id).await?;
                }
                Err(e) => {
                    warn!("re-attaching session {id}: {e:#}");
                    self.repo.mark_ended(&id).await?;
                }
            }
        }

        // Reconcile: rows that claim to be open but have no tmux session.
        for row in self.repo.list_open().await? {
            if !found.contains(&row.id) {
                info!("marking stale session {} ended", row.id);
                self.repo.mark_ended(&row.id).await?;
            }
        }

        Ok(())
    }

    /// Graceful shutdown: detach from every session, leaving tmux running.
    /// Purge additionally kills every hosted tmux session first.
    pub async fn shutdown(&self, purge: bool) {
        let sessions: Vec<(String, Arc<Session>)> = self
            .sessions
            .write()
            .await
            .drain()
            .collect();

        for (id, session) in sessions {
            if purge {
                if let Err(e) = self.driver.kill(session.tmux_name()).await {
                    warn!("killing session {id} during purge: {e:#}");
                }
                if let Err(e) = self.repo.mark_ended(&id).await {
                    warn!("retiring session {id} during purge: {e:#}");
                }
            }
            session.disconnect().await;
        }
    }
}
