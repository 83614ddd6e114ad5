//! Channel discipline over a real WebSocket: the first frame must be a
//! valid auth, and unknown tags get a descriptive error.

mod common;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use common::{test_config, FakeMux};
use remux::auth::AuthStore;
use remux::daemon::AppState;
use remux::db::Database;
use remux::mux::Mux;
use remux::session::registry::SessionRegistry;
use remux::session::repository::SessionRepository;
use remux::ws::{ws_handler, ClientHub, ClientMessage, ServerMessage};

async fn serve() -> (String, String) {
    let db = Database::in_memory().await.unwrap();
    let auth = AuthStore::new(db.clone());
    let token = auth.token().await.unwrap();
    let repo = SessionRepository::new(db.pool().clone());
    let mux: Arc<dyn Mux> = FakeMux::new();
    let registry = SessionRegistry::new(repo, mux, test_config());

    let state = AppState {
        registry,
        hub: Arc::new(ClientHub::new()),
        auth,
        config: Arc::new(test_config()),
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{addr}/ws"), token)
}

async fn next_server_message(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> Option<ServerMessage> {
    while let Some(frame) = ws.next().await {
        match frame.ok()? {
            Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

fn encode(message: &ClientMessage) -> Message {
    Message::Text(serde_json::to_string(message).unwrap().into())
}

#[tokio::test]
async fn a_non_auth_first_message_gets_one_error_and_a_closed_channel() {
    let (url, _token) = serve().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    ws.send(encode(&ClientMessage::GetSessions {})).await.unwrap();

    let reply = next_server_message(&mut ws).await.unwrap();
    assert!(matches!(reply, ServerMessage::Error { .. }));
    // The channel is closed after the error.
    assert!(next_server_message(&mut ws).await.is_none());
}

#[tokio::test]
async fn a_wrong_token_is_rejected_and_the_channel_closes() {
    let (url, _token) = serve().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    ws.send(encode(&ClientMessage::Auth {
        token: "wrong-token".to_string(),
    }))
    .await
    .unwrap();

    let reply = next_server_message(&mut ws).await.unwrap();
    assert_eq!(reply, ServerMessage::AuthResult { success: false });
    assert!(next_server_message(&mut ws).await.is_none());
}

#[tokio::test]
async fn a_valid_auth_yields_capabilities_and_the_session_list() {
    let (url, token) = serve().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

    ws.send(encode(&ClientMessage::Auth { token })).await.unwrap();

    assert_eq!(
        next_server_message(&mut ws).await.unwrap(),
        ServerMessage::AuthResult { success: true }
    );
    let caps = next_server_message(&mut ws).await.unwrap();
    let ServerMessage::Capabilities { models, modes, .. } = caps else {
        panic!("expected capabilities, got {caps:?}");
    };
    assert!(!models.is_empty());
    assert!(modes.contains(&"plan".to_string()));

    let sessions = next_server_message(&mut ws).await.unwrap();
    assert_eq!(sessions, ServerMessage::SessionsList { sessions: vec![] });

    // Authenticated traffic now flows: ping/pong and unknown-tag errors.
    ws.send(encode(&ClientMessage::Ping {})).await.unwrap();
    assert_eq!(
        next_server_message(&mut ws).await.unwrap(),
        ServerMessage::Pong {}
    );

    ws.send(Message::Text(
        r#"{"type":"warp_core","payload":{}}"#.to_string().into(),
    ))
    .await
    .unwrap();
    let reply = next_server_message(&mut ws).await.unwrap();
    let ServerMessage::Error { message, .. } = reply else {
        panic!("expected error, got {reply:?}");
    };
    assert!(message.contains("unrecognized"));
}
