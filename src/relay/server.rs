//! WebSocket front of the relay: connection acceptance, authentication,
//! and per-connection read/write pumps.
//!
//! Clients connect to `/ws/{token}`. The token is resolved to an identity
//! before any message is processed; a token that fails to resolve gets the
//! handshake completed and then a policy close (code 4001) so the client
//! can tell auth failure from a network fault.

use crate::core::config::CLOSE_POLICY_UNAUTHORIZED;
use crate::core::signal::{ClientMessage, Identity, ServerMessage};
use crate::relay::registry::RoomRegistry;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Resolves an opaque connection token to a user identity.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate(&self, token: &str) -> Option<Identity>;
}

/// Default token scheme: the token is `"{user_id}:{username}"`, minted by
/// whatever issued the client its credentials. Anything without exactly
/// one separator or with an empty half fails.
pub struct TokenAuthenticator;

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<Identity> {
        let (user_id, username) = token.split_once(':')?;
        if user_id.is_empty() || username.is_empty() || username.contains(':') {
            return None;
        }
        Some(Identity {
            user_id: user_id.to_string(),
            username: username.to_string(),
        })
    }
}

/// The signaling relay server.
pub struct RelayServer {
    registry: Arc<Mutex<RoomRegistry>>,
    auth: Arc<dyn Authenticator>,
}

impl RelayServer {
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(RoomRegistry::new())),
            auth,
        }
    }

    /// Bind and return the listener separately from the accept loop so
    /// callers (and tests) can learn the actual port before serving.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding relay listener on {addr}"))
    }

    /// Accept loop. Runs until `sos` is cancelled; each connection gets
    /// its own task.
    pub async fn run(self: Arc<Self>, listener: TcpListener, sos: SignalOfStop) -> Result<()> {
        let local = listener.local_addr().context("reading listener address")?;
        info!(event = "relay_listening", addr = %local, "Relay accepting connections");

        loop {
            let accepted = match sos.select(listener.accept()).await {
                Ok(res) => res,
                Err(()) => {
                    info!(event = "relay_shutdown", "Relay accept loop stopping");
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            debug!(event = "connection_ended", %peer, error = %e);
                        }
                    });
                }
                Err(e) => warn!(event = "accept_failure", error = %e),
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut path = String::new();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await
        .context("websocket handshake")?;

        let token = path.strip_prefix("/ws/").unwrap_or_default();
        let Some(identity) = self.auth.authenticate(token) else {
            warn!(event = "auth_rejected", %peer, %path, "Closing unauthenticated connection");
            let (mut sink, _) = ws.split();
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Library(CLOSE_POLICY_UNAUTHORIZED),
                    reason: "invalid token".into(),
                })))
                .await;
            return Ok(());
        };

        let user_id = identity.user_id.clone();
        info!(event = "client_connected", user = %user_id, %peer);

        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        self.registry.lock().await.connect(identity, tx);

        // Writer pump: the registry pushes onto the queue under its lock;
        // serialization and socket writes happen out here.
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = "serialize_failure", error = %e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(frame) = source.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(event = "read_failure", user = %user_id, error = %e);
                    break;
                }
            };
            match frame {
                Message::Text(text) => {
                    let msg: ClientMessage = match serde_json::from_str(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(
                                event = "malformed_message",
                                user = %user_id,
                                error = %e,
                                "Ignoring message that does not parse"
                            );
                            continue;
                        }
                    };
                    self.dispatch(&user_id, msg).await;
                }
                Message::Close(_) => break,
                // Pings are answered by tungstenite itself; binary has no
                // meaning on the signaling socket.
                Message::Binary(_) => {
                    warn!(event = "binary_on_signaling", user = %user_id);
                }
                _ => {}
            }
        }

        self.registry.lock().await.disconnect(&user_id);
        writer.abort();
        info!(event = "client_disconnected", user = %user_id);
        Ok(())
    }

    async fn dispatch(&self, user_id: &str, msg: ClientMessage) {
        let mut registry = self.registry.lock().await;
        match &msg {
            ClientMessage::JoinRoom { room_id } => registry.join(user_id, room_id),
            ClientMessage::LeaveRoom => registry.leave(user_id),
            _ => registry.forward(user_id, &msg),
        }
    }
}
