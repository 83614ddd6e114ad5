//! WebSocket client used by the CLI helpers.
//!
//! Each remote command dials the daemon on localhost, authenticates with
//! the stored token, issues one request, awaits the paired reply, and
//! disconnects. Broadcast frames that arrive in between are skipped.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::ws::{ClientMessage, ServerMessage};

/// Handshake (connect + auth) timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a request's paired reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// One authenticated connection to the daemon.
pub struct DaemonClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl DaemonClient {
    /// Dial and authenticate.
    pub async fn connect(port: u16, token: &str) -> Result<Self> {
        let url = format!("ws://127.0.0.1:{port}/ws");
        let connect = async {
            let (ws, _) = connect_async(url.as_str())
                .await
                .with_context(|| format!("connecting to {url}"))?;
            let mut client = Self { ws };
            client
                .send(ClientMessage::Auth {
                    token: token.to_string(),
                })
                .await?;
            match client.next_message().await? {
                ServerMessage::AuthResult { success: true } => Ok(client),
                ServerMessage::AuthResult { success: false } => {
                    bail!("authentication rejected; run `remux token` on the host")
                }
                other => bail!("unexpected handshake reply: {other:?}"),
            }
        };

        tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to the daemon on port {port}"))?
    }

    /// Send one message.
    pub async fn send(&mut self, message: ClientMessage) -> Result<()> {
        let json = serde_json::to_string(&message)?;
        self.ws
            .send(Message::Text(json.into()))
            .await
            .context("sending request")?;
        Ok(())
    }

    /// Send a request and wait for the reply `matches` accepts. Unrelated
    /// broadcast traffic is skipped; an `error` frame fails the request.
    pub async fn request(
        &mut self,
        message: ClientMessage,
        matches: impl Fn(&ServerMessage) -> bool,
    ) -> Result<ServerMessage> {
        self.send(message).await?;
        let wait = async {
            loop {
                let reply = self.next_message().await?;
                if matches(&reply) {
                    return Ok(reply);
                }
                if let ServerMessage::Error { message, .. } = reply {
                    bail!("{message}");
                }
            }
        };
        tokio::time::timeout(REPLY_TIMEOUT, wait)
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the daemon's reply"))?
    }

    async fn next_message(&mut self) -> Result<ServerMessage> {
        loop {
            let frame = self
                .ws
                .next()
                .await
                .context("connection closed by the daemon")??;
            match frame {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str()).context("decoding reply");
                }
                Message::Ping(payload) => {
                    let _ = self.ws.send(Message::Pong(payload)).await;
                }
                Message::Close(_) => bail!("connection closed by the daemon"),
                _ => continue,
            }
        }
    }

    /// Close politely.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
