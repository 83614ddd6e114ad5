//! remux - daemon that hosts long-lived assistant sessions inside detached
//! tmux sessions and multiplexes them to remote WebSocket clients.

pub mod auth;
pub mod classify;
pub mod client;
pub mod config;
pub mod daemon;
pub mod db;
pub mod files;
pub mod http;
pub mod mux;
pub mod session;
pub mod supervisor;
pub mod tls;
pub mod ws;
