//! WebSocket handler for client connections.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::daemon::AppState;
use crate::files::{browse_directories, FileError, ProjectFiles};
use crate::mux::decode_raw_key;
use crate::session::runtime::Session;

use super::types::{ClientMessage, ServerMessage};

/// Keep-alive interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut rx) = state.hub.register();

    // Drain the per-client queue onto the socket; 30 s keep-alive pings.
    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await;
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let json = match serde_json::to_string(&message) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("serializing outbound message: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) | Ok(Message::Ping(_)) => continue,
            Ok(Message::Binary(_)) => {
                debug!("ignoring binary frame from client {client_id}");
                continue;
            }
            Err(e) => {
                debug!("websocket error for client {client_id}: {e}");
                break;
            }
        };

        let parsed = serde_json::from_str::<ClientMessage>(&text);

        if !state.hub.is_authenticated(client_id) {
            // The first message must be a valid auth; anything else gets one
            // error frame and the channel closes.
            match parsed {
                Ok(ClientMessage::Auth { token }) => {
                    let ok = state.auth.verify(&token).await.unwrap_or(false);
                    state
                        .hub
                        .send_to(client_id, ServerMessage::AuthResult { success: ok });
                    if !ok {
                        info!("client {client_id} failed authentication");
                        break;
                    }
                    state.hub.authenticate(client_id);
                    state.hub.send_to(
                        client_id,
                        ServerMessage::Capabilities {
                            models: state.config.models.clone(),
                            modes: state.config.modes.clone(),
                            commands: state.config.commands.clone(),
                        },
                    );
                    state.hub.send_to(
                        client_id,
                        ServerMessage::SessionsList {
                            sessions: state.registry.snapshots().await,
                        },
                    );
                }
                _ => {
                    state.hub.send_to(
                        client_id,
                        ServerMessage::error("authentication required", None),
                    );
                    break;
                }
            }
            continue;
        }

        match parsed {
            Ok(message) => {
                let session_id = session_id_of(&message);
                if let Err(e) = handle_message(&state, client_id, message).await {
                    debug!("client {client_id} request failed: {e:#}");
                    state
                        .hub
                        .send_to(client_id, ServerMessage::error(e.to_string(), session_id));
                }
            }
            Err(e) => {
                state.hub.send_to(
                    client_id,
                    ServerMessage::error(format!("unrecognized message: {e}"), None),
                );
            }
        }
    }

    // Unregistering drops the queue's sender; the send task drains what is
    // left (a final error frame, usually) and closes the socket.
    state.hub.unregister(client_id);
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}

/// The session a message targets, for error attribution.
fn session_id_of(message: &ClientMessage) -> Option<String> {
    use ClientMessage::*;
    match message {
        GetOutput { session_id, .. }
        | KillSession { session_id }
        | RestartSession { session_id, .. }
        | ChangeModel { session_id, .. }
        | ToggleMode { session_id, .. }
        | SendInput { session_id, .. }
        | SendCommand { session_id, .. }
        | SendKey { session_id, .. }
        | ResizeTerminal { session_id, .. }
        | Scroll { session_id }
        | BrowseFiles { session_id, .. }
        | ReadFile { session_id, .. }
        | WriteFile { session_id, .. }
        | CreateFile { session_id, .. }
        | CreateDirectory { session_id, .. }
        | RenameFile { session_id, .. }
        | DeleteFile { session_id, .. } => Some(session_id.clone()),
        _ => None,
    }
}

async fn lookup(state: &AppState, session_id: &str) -> anyhow::Result<Arc<Session>> {
    state
        .registry
        .get(session_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("unknown session: {session_id}"))
}

async fn project_files(state: &AppState, session_id: &str) -> anyhow::Result<ProjectFiles> {
    let session = lookup(state, session_id).await?;
    let snapshot = session.snapshot().await;
    Ok(ProjectFiles::new(&snapshot.project_path)?)
}

async fn handle_message(
    state: &AppState,
    client_id: u64,
    message: ClientMessage,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::Auth { .. } => {
            // Already authenticated; a second auth is a no-op ack.
            state
                .hub
                .send_to(client_id, ServerMessage::AuthResult { success: true });
        }

        ClientMessage::Ping {} => {
            state.hub.send_to(client_id, ServerMessage::Pong {});
        }

        ClientMessage::GetSessions {} => {
            state.hub.send_to(
                client_id,
                ServerMessage::SessionsList {
                    sessions: state.registry.snapshots().await,
                },
            );
        }

        ClientMessage::GetOutput { session_id, lines } => {
            let session = lookup(state, &session_id).await?;
            let content = session.current_screen(lines).await;
            state
                .hub
                .send_to(client_id, ServerMessage::OutputUpdate { session_id, content });
        }

        ClientMessage::CreateSession {
            project_path,
            model,
            plan_mode,
            session_type,
        } => {
            // The broadcast `session_created` also reaches the requester.
            state
                .registry
                .create_session(crate::session::models::CreateSessionParams {
                    project_path,
                    model,
                    plan_mode,
                    session_type,
                })
                .await?;
        }

        ClientMessage::KillSession { session_id } => {
            state.registry.kill_session(&session_id).await?;
        }

        ClientMessage::RestartSession {
            session_id,
            with_summary,
        } => {
            state
                .registry
                .restart_session(&session_id, with_summary, None)
                .await?;
        }

        ClientMessage::ChangeModel { session_id, model } => {
            state
                .registry
                .restart_session(&session_id, true, Some(model))
                .await?;
        }

        ClientMessage::ToggleMode {
            session_id,
            mode,
            enabled,
        } => {
            state.registry.toggle_mode(&session_id, &mode, enabled).await?;
        }

        ClientMessage::SendInput { session_id, input } => {
            lookup(state, &session_id).await?.send_input_line(&input).await?;
        }

        ClientMessage::SendCommand {
            session_id,
            command,
        } => {
            // Slash commands go to the assistant verbatim.
            lookup(state, &session_id)
                .await?
                .send_input_line(&command)
                .await?;
        }

        ClientMessage::SendKey { session_id, key } => {
            let session = lookup(state, &session_id).await?;
            // Last interactor wins: typing from a viewport that differs from
            // the session's current size re-sizes the session first.
            if let Some((cols, rows)) = state.hub.viewport(client_id) {
                if session.size().await != (cols, rows) {
                    session.resize(cols, rows).await;
                }
            }
            session.send_key(&decode_raw_key(&key)).await?;
        }

        ClientMessage::ResizeTerminal {
            session_id,
            cols,
            rows,
        } => {
            state.hub.set_viewport(client_id, cols, rows);
            lookup(state, &session_id).await?.resize(cols, rows).await;
        }

        ClientMessage::Scroll { session_id } => {
            let content = lookup(state, &session_id).await?.scrollback().await;
            state.hub.send_to(
                client_id,
                ServerMessage::ScrollbackContent {
                    session_id,
                    content,
                },
            );
        }

        ClientMessage::BrowseDirectory { path } => {
            let message = match browse_directories(&path).await {
                Ok((resolved, directories)) => ServerMessage::DirectoryListing {
                    path: resolved,
                    directories,
                    error: None,
                },
                Err(e) => ServerMessage::DirectoryListing {
                    path,
                    directories: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            state.hub.send_to(client_id, message);
        }

        ClientMessage::BrowseFiles { session_id, path } => {
            let files = project_files(state, &session_id).await?;
            let message = match files.list(path.as_deref()).await {
                Ok((path, entries)) => ServerMessage::FileList {
                    session_id,
                    path,
                    entries,
                    error: None,
                },
                Err(e) => ServerMessage::FileList {
                    session_id,
                    path: path.unwrap_or_default(),
                    entries: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            state.hub.send_to(client_id, message);
        }

        ClientMessage::ReadFile { session_id, path } => {
            let files = project_files(state, &session_id).await?;
            let message = match files.read(&path).await {
                Ok(content) => ServerMessage::FileContent {
                    session_id,
                    path,
                    content,
                    error: None,
                },
                Err(e) => ServerMessage::FileContent {
                    session_id,
                    path,
                    content: String::new(),
                    error: Some(e.to_string()),
                },
            };
            state.hub.send_to(client_id, message);
        }

        ClientMessage::WriteFile {
            session_id,
            path,
            content,
        } => {
            let files = project_files(state, &session_id).await?;
            let message = file_result(files.write(&path, &content).await, |success, error| {
                ServerMessage::FileWriteResult { success, error }
            });
            state.hub.send_to(client_id, message);
        }

        ClientMessage::CreateFile { session_id, path } => {
            let files = project_files(state, &session_id).await?;
            let message = file_result(files.create_file(&path).await, |success, error| {
                ServerMessage::FileCreateResult { success, error }
            });
            state.hub.send_to(client_id, message);
        }

        ClientMessage::CreateDirectory { session_id, path } => {
            let files = project_files(state, &session_id).await?;
            let message = file_result(files.create_directory(&path).await, |success, error| {
                ServerMessage::DirectoryCreateResult { success, error }
            });
            state.hub.send_to(client_id, message);
        }

        ClientMessage::RenameFile {
            session_id,
            path,
            new_name,
        } => {
            let files = project_files(state, &session_id).await?;
            let message = file_result(files.rename(&path, &new_name).await, |success, error| {
                ServerMessage::FileRenameResult { success, error }
            });
            state.hub.send_to(client_id, message);
        }

        ClientMessage::DeleteFile { session_id, path } => {
            let files = project_files(state, &session_id).await?;
            let message = file_result(files.delete(&path).await, |success, error| {
                ServerMessage::FileDeleteResult { success, error }
            });
            state.hub.send_to(client_id, message);
        }
    }

    Ok(())
}

fn file_result(
    result: Result<(), FileError>,
    build: impl FnOnce(bool, Option<String>) -> ServerMessage,
) -> ServerMessage {
    match result {
        Ok(()) => build(true, None),
        Err(e) => build(false, Some(e.to_string())),
    }
}
