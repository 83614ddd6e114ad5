//! Session domain: records, persistence, live runtime, registry.

pub mod models;
pub mod registry;
pub mod repository;
pub mod runtime;

pub use models::{SessionKind, SessionRecord, SessionState};
pub use registry::{SessionEvent, SessionRegistry};
pub use repository::SessionRepository;
pub use runtime::Session;
