//! Client-facing WebSocket layer: protocol types, connection hub, handler.

pub mod handler;
pub mod hub;
pub mod types;

pub use handler::ws_handler;
pub use hub::ClientHub;
pub use types::{ClientMessage, ServerMessage};
