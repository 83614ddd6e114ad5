//! Plain HTTP surface next to the WebSocket endpoint: static assets for the
//! bundled front-end and the token-gated file download.

pub mod assets;
pub mod download;
