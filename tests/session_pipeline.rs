//! End-to-end behavior of one session: resize gating, capture debounce,
//! screen dedup, classifier-driven state transitions, death detection.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use common::{settle, test_config, FakeMux};
use remux::db::Database;
use remux::session::models::{SessionKind, SessionRecord, SessionState};
use remux::session::registry::SessionEvent;
use remux::session::repository::SessionRepository;
use remux::session::runtime::{cursor_escape, Session};

const ID: &str = "aaaabbbbcccc";

struct Fixture {
    mux: Arc<FakeMux>,
    session: Arc<Session>,
    events: broadcast::Receiver<SessionEvent>,
    repo: SessionRepository,
    name: String,
}

async fn start_session() -> Fixture {
    let db = Database::in_memory().await.unwrap();
    let repo = SessionRepository::new(db.pool().clone());
    let record = SessionRecord::new(
        ID.to_string(),
        SessionKind::Assistant,
        "/tmp".to_string(),
        None,
        false,
    );
    repo.insert(&record).await.unwrap();

    let mux = FakeMux::new();
    mux.set_screen(b"$ \n");
    let (tx, events) = broadcast::channel(256);
    let config = test_config();
    let name = config.tmux_name(ID);
    let session = Session::new(record, mux.clone(), repo.clone(), config, tx);
    session.start_fresh().await.unwrap();

    Fixture {
        mux,
        session,
        events,
        repo,
        name,
    }
}

/// Drain pending events, returning those matching the filter.
fn drain<F: Fn(&SessionEvent) -> bool>(
    rx: &mut broadcast::Receiver<SessionEvent>,
    keep: F,
) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if keep(&event) {
            out.push(event);
        }
    }
    out
}

fn is_output(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Output { .. })
}

#[tokio::test]
async fn no_output_before_the_first_resize() {
    let mut f = start_session().await;

    for i in 0..5 {
        f.mux.feed(&f.name, format!("plain output {i}\n").as_bytes()).await;
    }
    settle().await;

    assert_eq!(f.mux.capture_count(), 0);
    assert!(drain(&mut f.events, is_output).is_empty());

    // The first declared viewport opens the gate.
    f.session.resize(80, 24).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    f.mux.feed(&f.name, b"more output\n").await;
    settle().await;

    assert!(f.mux.capture_count() >= 1);
    let outputs = drain(&mut f.events, is_output);
    assert!(!outputs.is_empty());
}

#[tokio::test]
async fn a_burst_of_activity_coalesces_into_one_capture() {
    let f = start_session().await;
    f.session.resize(80, 24).await;
    // Let the post-resize forced capture pass.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let before = f.mux.capture_count();

    for i in 0..8 {
        f.mux.feed(&f.name, format!("burst {i}\n").as_bytes()).await;
    }
    settle().await;

    assert_eq!(f.mux.capture_count(), before + 1);
}

#[tokio::test]
async fn identical_screens_are_emitted_at_most_once() {
    let mut f = start_session().await;
    f.session.resize(80, 24).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    drain(&mut f.events, is_output);

    // Screen content never changes across two separate bursts.
    f.mux.feed(&f.name, b"tick\n").await;
    settle().await;
    f.mux.feed(&f.name, b"tock\n").await;
    settle().await;

    assert!(f.mux.capture_count() >= 2);
    assert!(drain(&mut f.events, is_output).is_empty());
}

#[tokio::test]
async fn emitted_screen_is_postprocessed_with_cursor_suffix() {
    let mut f = start_session().await;
    f.mux.set_screen(b"hello   \nworld\n\n\n");
    f.mux.set_cursor(1, 5);
    f.session.resize(80, 24).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outputs = drain(&mut f.events, is_output);
    let SessionEvent::Output { content, .. } = outputs.last().expect("one output") else {
        unreachable!();
    };
    assert_eq!(content, &format!("hello\nworld{}", cursor_escape(1, 5)));
}

#[tokio::test]
async fn confirmation_prompt_raises_input_required() {
    let mut f = start_session().await;

    f.mux
        .feed(&f.name, b"Do you want to proceed? (y/n)")
        .await;
    settle().await;

    assert_eq!(f.session.state().await, SessionState::AwaitingConfirmation);
    let events = drain(&mut f.events, |e| {
        matches!(e, SessionEvent::InputRequired { .. })
    });
    assert_eq!(events.len(), 1);
    let SessionEvent::InputRequired {
        input_type,
        question,
        options,
        ..
    } = &events[0]
    else {
        unreachable!();
    };
    assert_eq!(*input_type, remux::classify::InputKind::Confirmation);
    assert!(question.contains('?'));
    assert!(options.is_none());
}

#[tokio::test]
async fn context_exhaustion_dominates_working_indicators() {
    let mut f = start_session().await;

    f.mux
        .feed(&f.name, b"... Thinking ... conversation is too long ...")
        .await;
    settle().await;

    assert_eq!(f.session.state().await, SessionState::ContextLimit);
    let limits = drain(&mut f.events, |e| {
        matches!(e, SessionEvent::ContextLimit { .. })
    });
    assert_eq!(limits.len(), 1);
}

#[tokio::test]
async fn working_then_quiet_goes_back_to_idle() {
    let f = start_session().await;

    f.mux.feed(&f.name, b"Running tests...").await;
    settle().await;
    assert_eq!(f.session.state().await, SessionState::Working);

    // Idle threshold in the test config is 400 ms.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(f.session.state().await, SessionState::Idle);
}

#[tokio::test]
async fn send_input_line_marks_an_assistant_session_working() {
    let f = start_session().await;

    f.session.send_input_line("explain this code").await.unwrap();
    assert_eq!(f.session.state().await, SessionState::Working);

    let sent = f.mux.sent_keys();
    assert_eq!(sent[0].1, "literal:explain this code");
    assert_eq!(sent[1].1, "key:Enter");
}

#[tokio::test]
async fn a_dead_multiplexer_session_is_detected_and_retired() {
    let mut f = start_session().await;

    f.mux.drop_alive(&f.name);
    f.mux.close_reader(&f.name);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(f.session.state().await, SessionState::Dead);
    let exits = drain(&mut f.events, |e| matches!(e, SessionEvent::Exit { .. }));
    assert_eq!(exits.len(), 1);

    let row = f.repo.get(ID).await.unwrap().unwrap();
    assert_eq!(row.state, SessionState::Dead);
    assert!(row.ended_at.is_some());

    // Input to a dead session is a state error, not a crash.
    assert!(f.session.send_input_line("hello?").await.is_err());
}

#[tokio::test]
async fn scrollback_returns_the_whole_buffer() {
    let f = start_session().await;
    f.mux.set_screen(b"current pane\n");
    let scrollback = f.session.scrollback().await;
    assert!(scrollback.starts_with("[history]"));
    assert!(scrollback.contains("current pane"));
}
