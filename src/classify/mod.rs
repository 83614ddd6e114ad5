//! Streaming output classifier.
//!
//! The hosted assistant is a third-party interactive TUI we cannot
//! instrument, so session state is inferred from its rendered output. Each
//! chunk of raw terminal bytes is tested against three ordered pattern
//! families; the first hit wins. Context exhaustion dominates working,
//! working dominates input detection.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Rolling context window kept by the classifier, in bytes.
const WINDOW_LIMIT: usize = 10_000;

/// What kind of input the hosted program is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Confirmation,
    Selection,
    OpenQuestion,
}

impl std::fmt::Display for InputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputKind::Confirmation => write!(f, "confirmation"),
            InputKind::Selection => write!(f, "selection"),
            InputKind::OpenQuestion => write!(f, "open_question"),
        }
    }
}

/// Classification of a single output chunk. At most one per chunk; the
/// caller emits an activity signal for every chunk regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The conversation hit its context limit.
    ContextExhausted { window: String },
    /// The assistant is actively processing.
    Working,
    /// The program is waiting on the user.
    InputRequired {
        kind: InputKind,
        question: String,
        options: Option<Vec<String>>,
    },
}

static RE_CONTEXT_EXHAUSTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(context (window|limit)|too long|maximum.{0,40}token|conversation is too long|context.{0,40}exceeded)",
    )
    .unwrap()
});

static RE_WORKING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(Thinking|Reading|Writing|Running|Searching|Analyzing|Editing|Creating)|[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
    )
    .unwrap()
});

static RE_CONFIRMATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\(y/n\)|\[y/n\]|\[yes/no\]|Do you want)").unwrap());

static RE_TOOL_APPROVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(Allow .{1,80} to run|Press Enter to (run|Approve|Reject|Edit))").unwrap()
});

static RE_SELECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(Choose an option|Select .{1,60}:|^\s*\[\d+\])").unwrap());

static RE_OPTION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\[(\d+)\]\s*(.+?)\s*$").unwrap());

static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    // CSI sequences, OSC sequences, and stray single-char escapes.
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-_]").unwrap()
});

/// Remove escape sequences and carriage returns so the pattern families see
/// plain text.
pub fn strip_ansi(input: &str) -> String {
    RE_ANSI.replace_all(input, "").replace('\r', "")
}

/// Streaming classifier over one session's output.
///
/// Holds the rolling context window. A failure to classify a chunk (bad
/// UTF-8, no pattern hit) degrades to "no classification"; the caller still
/// treats the chunk as activity.
#[derive(Debug, Default)]
pub struct Classifier {
    window: String,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The rolling context window accumulated so far.
    pub fn window(&self) -> &str {
        &self.window
    }

    /// Ingest one chunk and classify it. Returns at most one classification;
    /// a later chunk may re-fire the same one.
    pub fn ingest(&mut self, chunk: &[u8]) -> Option<Classification> {
        let text = String::from_utf8_lossy(chunk);
        self.push_window(&text);

        let plain = strip_ansi(&text);
        if plain.trim().is_empty() {
            return None;
        }

        if RE_CONTEXT_EXHAUSTED.is_match(&plain) {
            return Some(Classification::ContextExhausted {
                window: self.window.clone(),
            });
        }

        if RE_WORKING.is_match(&plain) {
            return Some(Classification::Working);
        }

        self.classify_input(&plain)
    }

    fn classify_input(&self, plain: &str) -> Option<Classification> {
        let kind = if RE_CONFIRMATION.is_match(plain) || RE_TOOL_APPROVAL.is_match(plain) {
            InputKind::Confirmation
        } else if RE_SELECTION.is_match(plain) {
            InputKind::Selection
        } else if last_nonempty_line(plain).is_some_and(|l| l.trim_end().ends_with('?')) {
            InputKind::OpenQuestion
        } else {
            return None;
        };

        let options = match kind {
            InputKind::Selection => {
                let opts: Vec<String> = RE_OPTION_MARKER
                    .captures_iter(plain)
                    .map(|c| c[2].trim().to_string())
                    .collect();
                if opts.is_empty() {
                    None
                } else {
                    Some(opts)
                }
            }
            _ => None,
        };

        Some(Classification::InputRequired {
            kind,
            question: extract_question(plain),
            options,
        })
    }

    fn push_window(&mut self, text: &str) {
        self.window.push_str(text);
        if self.window.len() > WINDOW_LIMIT {
            let cut = self.window.len() - WINDOW_LIMIT;
            // Stay on a char boundary when trimming the front.
            let cut = (cut..self.window.len())
                .find(|i| self.window.is_char_boundary(*i))
                .unwrap_or(self.window.len());
            self.window.drain(..cut);
        }
    }
}

/// The last line that contains `?` or `(y/n)`, else the last non-empty line.
fn extract_question(plain: &str) -> String {
    let lines: Vec<&str> = plain.lines().collect();
    lines
        .iter()
        .rev()
        .find(|l| l.contains('?') || l.to_lowercase().contains("(y/n)"))
        .or_else(|| lines.iter().rev().find(|l| !l.trim().is_empty()))
        .map(|l| l.trim().to_string())
        .unwrap_or_default()
}

fn last_nonempty_line(plain: &str) -> Option<&str> {
    plain.lines().rev().find(|l| !l.trim().is_empty())
}
