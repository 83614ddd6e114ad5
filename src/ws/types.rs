//! Wire protocol between clients and the daemon.
//!
//! Every frame is UTF-8 JSON shaped `{ "type": ..., "payload": {...} }`.
//! Unknown tags are rejected with a descriptive `error` frame rather than a
//! dropped connection.

use serde::{Deserialize, Serialize};

use crate::classify::InputKind;
use crate::files::FileEntry;
use crate::session::models::SessionSnapshot;

/// Messages a client sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },
    Ping {},
    GetSessions {},
    #[serde(rename_all = "camelCase")]
    GetOutput {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lines: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    CreateSession {
        project_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default)]
        plan_mode: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_type: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    KillSession {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RestartSession {
        session_id: String,
        with_summary: bool,
    },
    #[serde(rename_all = "camelCase")]
    ChangeModel {
        session_id: String,
        model: String,
    },
    #[serde(rename_all = "camelCase")]
    ToggleMode {
        session_id: String,
        mode: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    SendInput {
        session_id: String,
        input: String,
    },
    #[serde(rename_all = "camelCase")]
    SendCommand {
        session_id: String,
        command: String,
    },
    #[serde(rename_all = "camelCase")]
    SendKey {
        session_id: String,
        key: String,
    },
    #[serde(rename_all = "camelCase")]
    ResizeTerminal {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Scroll {
        session_id: String,
    },
    BrowseDirectory {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    BrowseFiles {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ReadFile {
        session_id: String,
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    WriteFile {
        session_id: String,
        path: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateFile {
        session_id: String,
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    CreateDirectory {
        session_id: String,
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    RenameFile {
        session_id: String,
        path: String,
        new_name: String,
    },
    #[serde(rename_all = "camelCase")]
    DeleteFile {
        session_id: String,
        path: String,
    },
}

/// Messages the daemon sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthResult {
        success: bool,
    },
    Pong {},
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Capabilities {
        models: Vec<String>,
        modes: Vec<String>,
        commands: Vec<String>,
    },
    SessionsList {
        sessions: Vec<SessionSnapshot>,
    },
    SessionCreated {
        session: SessionSnapshot,
    },
    SessionUpdated {
        session: SessionSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    SessionKilled {
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    InputRequired {
        session_id: String,
        input_type: InputKind,
        context: String,
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
        timestamp: String,
    },
    #[serde(rename_all = "camelCase")]
    OutputUpdate {
        session_id: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ContextLimit {
        session_id: String,
        message: String,
    },
    DirectoryListing {
        path: String,
        directories: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScrollbackContent {
        session_id: String,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    FileList {
        session_id: String,
        path: String,
        entries: Vec<FileEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileContent {
        session_id: String,
        path: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileWriteResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileCreateResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DirectoryCreateResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileRenameResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FileDeleteResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerMessage {
    /// Shorthand for an error frame.
    pub fn error(message: impl Into<String>, session_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::models::{SessionKind, SessionRecord, SessionSnapshot};

    fn round_trip_client(msg: ClientMessage) {
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
        // encode(decode(encoded)) is byte-identical
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    fn round_trip_server(msg: ServerMessage) {
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn client_messages_round_trip() {
        round_trip_client(ClientMessage::Auth {
            token: "t0k3n".into(),
        });
        round_trip_client(ClientMessage::Ping {});
        round_trip_client(ClientMessage::GetSessions {});
        round_trip_client(ClientMessage::GetOutput {
            session_id: "abc123def456".into(),
            lines: Some(40),
        });
        round_trip_client(ClientMessage::CreateSession {
            project_path: "/tmp/proj".into(),
            model: Some("opus".into()),
            plan_mode: true,
            session_type: Some("assistant".into()),
        });
        round_trip_client(ClientMessage::SendKey {
            session_id: "abc123def456".into(),
            key: "\u{1b}[A".into(),
        });
        round_trip_client(ClientMessage::ResizeTerminal {
            session_id: "abc123def456".into(),
            cols: 120,
            rows: 40,
        });
        round_trip_client(ClientMessage::RenameFile {
            session_id: "abc123def456".into(),
            path: "src/old.rs".into(),
            new_name: "new.rs".into(),
        });
    }

    #[test]
    fn server_messages_round_trip() {
        let record = SessionRecord::new(
            "abc123def456".into(),
            SessionKind::Assistant,
            "/tmp/proj".into(),
            Some("opus".into()),
            false,
        );
        round_trip_server(ServerMessage::SessionCreated {
            session: SessionSnapshot::from(&record),
        });
        round_trip_server(ServerMessage::AuthResult { success: true });
        round_trip_server(ServerMessage::Pong {});
        round_trip_server(ServerMessage::error("bad path", Some("abc123def456".into())));
        round_trip_server(ServerMessage::InputRequired {
            session_id: "abc123def456".into(),
            input_type: crate::classify::InputKind::Selection,
            context: "pick one".into(),
            question: "Choose an option:".into(),
            options: Some(vec!["Continue".into(), "Abort".into()]),
            timestamp: "2025-01-01T00:00:00Z".into(),
        });
        round_trip_server(ServerMessage::OutputUpdate {
            session_id: "abc123def456".into(),
            content: "screen\u{1b}[2;5H".into(),
        });
    }

    #[test]
    fn wire_shape_is_type_plus_payload() {
        let json = serde_json::to_value(ClientMessage::Ping {}).unwrap();
        assert_eq!(json["type"], "ping");
        assert!(json["payload"].is_object());

        let json = serde_json::to_value(ClientMessage::CreateSession {
            project_path: "/p".into(),
            model: None,
            plan_mode: false,
            session_type: None,
        })
        .unwrap();
        assert_eq!(json["type"], "create_session");
        assert_eq!(json["payload"]["projectPath"], "/p");
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let err = serde_json::from_str::<ClientMessage>(r#"{"type":"warp_core","payload":{}}"#);
        assert!(err.is_err());
    }
}
