//! Session data models.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Length of the opaque session id.
const SESSION_ID_LEN: usize = 12;

/// URL-safe alphabet for session ids.
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_";

/// What a session hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// The configured AI coding assistant.
    Assistant,
    /// The user's login shell.
    Shell,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::Assistant => write!(f, "assistant"),
            SessionKind::Shell => write!(f, "shell"),
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "assistant" => Ok(SessionKind::Assistant),
            "shell" => Ok(SessionKind::Shell),
            _ => Err(format!("unknown session kind: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Session lifecycle state.
///
/// The walk is monotone through `starting` into the live states and ends in
/// `dead` or `error`; only those two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Idle,
    Working,
    AwaitingInput,
    AwaitingConfirmation,
    ContextLimit,
    Dead,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Dead | SessionState::Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Idle => "idle",
            SessionState::Working => "working",
            SessionState::AwaitingInput => "awaiting_input",
            SessionState::AwaitingConfirmation => "awaiting_confirmation",
            SessionState::ContextLimit => "context_limit",
            SessionState::Dead => "dead",
            SessionState::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(SessionState::Starting),
            "idle" => Ok(SessionState::Idle),
            "working" => Ok(SessionState::Working),
            "awaiting_input" => Ok(SessionState::AwaitingInput),
            "awaiting_confirmation" => Ok(SessionState::AwaitingConfirmation),
            "context_limit" => Ok(SessionState::ContextLimit),
            "dead" => Ok(SessionState::Dead),
            "error" => Ok(SessionState::Error),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

/// One persisted session.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    /// Opaque printable id, 12 chars, URL-safe.
    pub id: String,
    /// What the session hosts.
    #[sqlx(try_from = "String")]
    pub session_type: SessionKind,
    /// Absolute project root.
    pub project_path: String,
    /// Model identifier (assistant kind only).
    pub model: Option<String>,
    /// Plan-mode flag.
    pub plan_mode: bool,
    /// Auto-accept flag.
    pub auto_accept: bool,
    /// Current lifecycle state.
    #[sqlx(try_from = "String")]
    pub state: SessionState,
    /// Last-declared terminal width.
    pub cols: i64,
    /// Last-declared terminal height.
    pub rows: i64,
    /// When the session was created.
    pub created_at: String,
    /// Last observed activity.
    pub updated_at: String,
    /// When the session ended; set exactly when state is dead.
    pub ended_at: Option<String>,
    /// Free-text continuation summary from a restart, if any.
    pub summary: Option<String>,
}

impl SessionRecord {
    /// Fresh record in the `starting` state.
    pub fn new(
        id: String,
        kind: SessionKind,
        project_path: String,
        model: Option<String>,
        plan_mode: bool,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            id,
            session_type: kind,
            project_path,
            model,
            plan_mode,
            auto_accept: false,
            state: SessionState::Starting,
            cols: 80,
            rows: 24,
            created_at: now.clone(),
            updated_at: now,
            ended_at: None,
            summary: None,
        }
    }
}

/// Wire-facing view of a session, exactly as clients see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub session_type: SessionKind,
    pub project_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub plan_mode: bool,
    pub auto_accept: bool,
    pub state: SessionState,
    pub cols: u16,
    pub rows: u16,
    pub created_at: String,
    pub last_activity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

impl From<&SessionRecord> for SessionSnapshot {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            session_type: record.session_type,
            project_path: record.project_path.clone(),
            model: record.model.clone(),
            plan_mode: record.plan_mode,
            auto_accept: record.auto_accept,
            state: record.state,
            cols: record.cols as u16,
            rows: record.rows as u16,
            created_at: record.created_at.clone(),
            last_activity: record.updated_at.clone(),
            ended_at: record.ended_at.clone(),
        }
    }
}

/// Parameters for creating a session, as they arrive from a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSessionParams {
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,
}

/// Generate a new 12-char URL-safe session id.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Current wall-clock time as the store's timestamp format.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
