//! Connection hub.
//!
//! Tracks every connected client with its auth state and last-declared
//! viewport. Outbound traffic goes through a bounded per-client queue so a
//! slow client can never stall a broadcast; a client that overflows its
//! queue is disconnected.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use log::{info, warn};
use tokio::sync::mpsc;

use super::types::ServerMessage;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 256;

struct ClientEntry {
    tx: mpsc::Sender<ServerMessage>,
    authenticated: bool,
    viewport: Option<(u16, u16)>,
}

/// All connected clients.
#[derive(Default)]
pub struct ClientHub {
    clients: DashMap<u64, ClientEntry>,
    next_id: AtomicU64,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, not-yet-authenticated connection. Returns the client
    /// id and the receiving half of its send queue.
    pub fn register(&self) -> (u64, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        self.clients.insert(
            id,
            ClientEntry {
                tx,
                authenticated: false,
                viewport: None,
            },
        );
        info!("client {id} connected");
        (id, rx)
    }

    pub fn unregister(&self, id: u64) {
        if self.clients.remove(&id).is_some() {
            info!("client {id} disconnected");
        }
    }

    pub fn authenticate(&self, id: u64) {
        if let Some(mut entry) = self.clients.get_mut(&id) {
            entry.authenticated = true;
        }
    }

    pub fn is_authenticated(&self, id: u64) -> bool {
        self.clients
            .get(&id)
            .map(|e| e.authenticated)
            .unwrap_or(false)
    }

    /// Record the client's declared viewport.
    pub fn set_viewport(&self, id: u64, cols: u16, rows: u16) {
        if let Some(mut entry) = self.clients.get_mut(&id) {
            entry.viewport = Some((cols, rows));
        }
    }

    pub fn viewport(&self, id: u64) -> Option<(u16, u16)> {
        self.clients.get(&id).and_then(|e| e.viewport)
    }

    /// Queue a message for one client. A full queue drops the client.
    pub fn send_to(&self, id: u64, message: ServerMessage) {
        let overflowed = match self.clients.get(&id) {
            Some(entry) => match entry.tx.try_send(message) {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            None => false,
        };
        if overflowed {
            warn!("client {id} send queue overflow, disconnecting");
            self.unregister(id);
        }
    }

    /// Queue a message for every authenticated client.
    pub fn broadcast(&self, message: ServerMessage) {
        let mut overflowed = Vec::new();
        for entry in self.clients.iter() {
            if !entry.authenticated {
                continue;
            }
            match entry.tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*entry.key()),
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        for id in overflowed {
            warn!("client {id} send queue overflow during broadcast, disconnecting");
            self.unregister(id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_only_authenticated_clients() {
        let hub = ClientHub::new();
        let (a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        hub.authenticate(a);

        hub.broadcast(ServerMessage::Pong {});
        assert_eq!(rx_a.recv().await.unwrap(), ServerMessage::Pong {});
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_client_is_dropped_without_blocking() {
        let hub = ClientHub::new();
        let (a, rx_a) = hub.register();
        hub.authenticate(a);

        // Never drain the client; filling its queue past the buffer must
        // not block and must disconnect it.
        for _ in 0..=CONNECTION_BUFFER_SIZE {
            hub.broadcast(ServerMessage::Pong {});
        }
        assert_eq!(hub.client_count(), 0);

        // Buffered traffic is still readable after the disconnect.
        let mut rx_a = rx_a;
        assert!(rx_a.recv().await.is_some());
    }

    #[tokio::test]
    async fn viewport_round_trips() {
        let hub = ClientHub::new();
        let (a, _rx) = hub.register();
        assert_eq!(hub.viewport(a), None);
        hub.set_viewport(a, 120, 40);
        assert_eq!(hub.viewport(a), Some((120, 40)));
    }
}
