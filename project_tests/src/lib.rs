//! # End-to-end Test Harness
//!
//! Starts a real hub on an ephemeral port and drives it with WebSocket and
//! HTTP clients, the same way a browser would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lib_hub::core::{Hub, HubConfig};
use lib_hub::gateway::{cors_layer, router, serve_listener};
use lib_hub::protocol::HubMessage;

/// How long a client waits for the next frame before the test fails.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A hub served on `127.0.0.1:<ephemeral>`.
pub struct TestServer {
    /// Bound address.
    pub addr: SocketAddr,
    /// The hub behind the listener.
    pub hub: Arc<Hub>,
    server: JoinHandle<()>,
    engine: JoinHandle<()>,
}

impl TestServer {
    /// Binds, spawns the broadcast engine and starts serving.
    pub async fn start(config: HubConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (hub, engine) = Hub::new(config);
        let engine = engine.spawn();
        let app = router(Arc::clone(&hub), cors_layer(&["*".to_string()])?);
        let shutdown = hub.shutdown_token();
        let server = tokio::spawn(async move {
            if let Err(e) = serve_listener(listener, app, shutdown).await {
                eprintln!("test server stopped: {e}");
            }
        });

        Ok(Self { addr, hub, server, engine })
    }

    /// `http://<addr><path>`.
    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Opens a WebSocket and sends the identity announcement.
    pub async fn connect(&self, username: &str) -> Result<Client> {
        let mut client = self.connect_raw().await?;
        client
            .send_text(&serde_json::json!({ "username": username }).to_string())
            .await?;
        Ok(client)
    }

    /// Opens a WebSocket without announcing.
    pub async fn connect_raw(&self) -> Result<Client> {
        let url = format!("ws://{}/ws", self.addr);
        let (ws, _) = connect_async(url.as_str()).await.context("websocket connect")?;
        Ok(Client { ws })
    }

    /// Polls until `online` connections are registered.
    pub async fn wait_for_online(&self, online: usize) -> Result<()> {
        tokio::time::timeout(RECV_TIMEOUT, async {
            while self.hub.online() != online {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("expected {online} online, have {}", self.hub.online()))
    }

    /// Cancels the hub and waits for the listener and engine to stop.
    pub async fn stop(self) -> Result<()> {
        self.hub.shutdown();
        tokio::time::timeout(RECV_TIMEOUT, async {
            let _ = self.server.await;
            let _ = self.engine.await;
        })
        .await
        .map_err(|_| anyhow!("server did not stop"))
    }
}

/// One WebSocket client.
pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    /// Sends one text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Sends a chat frame with `content`.
    pub async fn say(&mut self, content: &str) -> Result<()> {
        self.send_text(&serde_json::json!({ "Content": content }).to_string()).await
    }

    /// Next hub message, skipping control frames.
    pub async fn recv(&mut self) -> Result<HubMessage> {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .map_err(|_| anyhow!("timed out waiting for a frame"))?
                .ok_or_else(|| anyhow!("connection closed"))??;
            match frame {
                Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
                Message::Close(_) => bail!("connection closed"),
                _ => continue,
            }
        }
    }

    /// Receives until a presence snapshot arrives and returns its identities.
    pub async fn recv_presence(&mut self) -> Result<Vec<String>> {
        loop {
            if let HubMessage::Presence(snapshot) = self.recv().await? {
                return Ok(snapshot.identities.iter().map(|i| i.as_str().to_string()).collect());
            }
        }
    }

    /// Receives until a presence snapshot equal to `expected` arrives.
    pub async fn expect_presence(&mut self, expected: &[&str]) -> Result<()> {
        loop {
            let seen = self.recv_presence().await?;
            if seen == expected {
                return Ok(());
            }
        }
    }

    /// Receives until a chat message arrives and returns `(sender, content)`.
    pub async fn recv_chat(&mut self) -> Result<(String, String)> {
        loop {
            if let HubMessage::Chat(chat) = self.recv().await? {
                return Ok((chat.sender.as_str().to_string(), chat.content));
            }
        }
    }

    /// `true` if the server closes the connection within the timeout.
    pub async fn closed_by_server(&mut self) -> bool {
        let outcome = tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        outcome.unwrap_or(false)
    }

    /// Sends a close frame.
    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
