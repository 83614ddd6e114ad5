//! Daemon assembly: wires the record store, registry, hub, and HTTP/WS
//! listener together and runs until a shutdown signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::auth::AuthStore;
use crate::config::{DaemonConfig, Paths};
use crate::db::Database;
use crate::http::{assets, download};
use crate::mux::{Mux, TmuxDriver};
use crate::session::registry::{SessionEvent, SessionRegistry};
use crate::session::repository::SessionRepository;
use crate::ws::{ws_handler, ClientHub, ServerMessage};

/// Uncaught panics tolerated inside one rolling window before the process
/// exits for a clean supervisor restart.
const PANIC_LIMIT: usize = 10;
const PANIC_WINDOW: Duration = Duration::from_secs(5);

/// Shared state for the HTTP/WS handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<ClientHub>,
    pub auth: AuthStore,
    pub config: Arc<DaemonConfig>,
}

/// Run the daemon until SIGTERM/SIGINT (graceful) or SIGUSR1 (purge).
pub async fn run(paths: Paths, config: DaemonConfig) -> Result<()> {
    paths.ensure()?;
    install_panic_guard();

    let db = Database::open(&paths.db_path()).await?;
    let auth = AuthStore::new(db.clone());
    // Issue the token eagerly so `remux token` works before any client.
    let _ = auth.token().await?;

    let repo = SessionRepository::new(db.pool().clone());
    let driver: Arc<dyn Mux> = Arc::new(TmuxDriver::new(paths.runtime_dir.clone()));
    let registry = SessionRegistry::new(repo, driver, config.clone());

    registry
        .rediscover()
        .await
        .context("rediscovering sessions")?;

    let hub = Arc::new(ClientHub::new());
    tokio::spawn(pump_events(registry.subscribe(), hub.clone()));

    let state = AppState {
        registry: registry.clone(),
        hub: hub.clone(),
        auth,
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/download", get(download::download))
        .fallback(assets::serve_asset)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    let purge = Arc::new(AtomicBool::new(false));
    let purge_flag = purge.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown(purge_flag).await;
        })
        .await
        .context("serving")?;

    let purge = purge.load(Ordering::SeqCst);
    info!(
        "shutting down ({})",
        if purge { "purge" } else { "graceful" }
    );
    registry.shutdown(purge).await;
    db.close().await;
    Ok(())
}

/// Resolves when a shutdown signal arrives; sets the purge flag on SIGUSR1.
async fn wait_for_shutdown(purge: Arc<AtomicBool>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("installing SIGTERM handler: {e}");
            std::future::pending::<()>().await;
            unreachable!();
        }
    };
    let mut usr1 = signal(SignalKind::user_defined1()).ok();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = async {
            match usr1.as_mut() {
                Some(s) => { s.recv().await; }
                None => std::future::pending().await,
            }
        } => {
            purge.store(true, Ordering::SeqCst);
        }
    }
}

/// Forward registry events to every authenticated client.
async fn pump_events(mut rx: broadcast::Receiver<SessionEvent>, hub: Arc<ClientHub>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(message) = wire_event(event) {
                    hub.broadcast(message);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("event pump lagged, dropped {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Session events as clients see them. `Exit` carries no extra frame: the
/// terminal `session_updated{state: dead}` already went out.
fn wire_event(event: SessionEvent) -> Option<ServerMessage> {
    match event {
        SessionEvent::Created { session } => Some(ServerMessage::SessionCreated { session }),
        SessionEvent::Updated { session } => Some(ServerMessage::SessionUpdated { session }),
        SessionEvent::Killed { session_id } => Some(ServerMessage::SessionKilled { session_id }),
        SessionEvent::Output {
            session_id,
            content,
        } => Some(ServerMessage::OutputUpdate {
            session_id,
            content,
        }),
        SessionEvent::InputRequired {
            session_id,
            input_type,
            context,
            question,
            options,
            timestamp,
        } => Some(ServerMessage::InputRequired {
            session_id,
            input_type,
            context,
            question,
            options,
            timestamp,
        }),
        SessionEvent::ContextLimit {
            session_id,
            message,
        } => Some(ServerMessage::ContextLimit {
            session_id,
            message,
        }),
        SessionEvent::Exit { .. } => None,
    }
}

/// Count uncaught panics; too many inside the rolling window means the
/// process is wedged and a supervisor restart is cleaner than limping on.
fn install_panic_guard() {
    let recent: Arc<Mutex<VecDeque<Instant>>> = Arc::new(Mutex::new(VecDeque::new()));
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        previous(panic_info);
        let mut recent = match recent.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        recent.push_back(now);
        while recent
            .front()
            .is_some_and(|t| now.duration_since(*t) > PANIC_WINDOW)
        {
            recent.pop_front();
        }
        if recent.len() > PANIC_LIMIT {
            eprintln!("too many panics in {PANIC_WINDOW:?}, exiting for restart");
            std::process::exit(1);
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::InputKind;
    use crate::session::models::{SessionKind, SessionRecord, SessionSnapshot};

    #[test]
    fn exit_events_produce_no_extra_frame() {
        assert!(wire_event(SessionEvent::Exit {
            session_id: "abc123def456".into()
        })
        .is_none());
    }

    #[test]
    fn events_map_to_their_wire_tags() {
        let record = SessionRecord::new(
            "abc123def456".into(),
            SessionKind::Shell,
            "/tmp".into(),
            None,
            false,
        );
        let created = wire_event(SessionEvent::Created {
            session: SessionSnapshot::from(&record),
        })
        .unwrap();
        assert!(matches!(created, ServerMessage::SessionCreated { .. }));

        let input = wire_event(SessionEvent::InputRequired {
            session_id: "abc123def456".into(),
            input_type: InputKind::Confirmation,
            context: String::new(),
            question: "proceed? (y/n)".into(),
            options: None,
            timestamp: "t".into(),
        })
        .unwrap();
        assert!(matches!(input, ServerMessage::InputRequired { .. }));
    }
}
