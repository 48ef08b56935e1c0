//! Endpoint driver: connects the transfer engine to the outside world.
//!
//! The engine is a pure state machine; this driver owns everything with a
//! side effect. It pumps two sources into the engine — the signaling
//! socket and the channel-event queue — and executes the actions the
//! engine hands back. Each action touches at most one of: the socket, the
//! per-transfer [`PeerChannel`] map, a spawned pipeline task, or the
//! history client.

use crate::core::config::DEFAULT_RELAY_ADDR;
use crate::core::connection::PeerChannel;
use crate::core::engine::{ChannelEvent, EngineAction, EngineOutcome, TransferEngine};
use crate::core::history::HistoryClient;
use crate::core::pipeline::sender::send_file;
use crate::core::signal::{ClientMessage, ServerMessage};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Everything an endpoint needs to participate in a room.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:8000`.
    pub relay_url: String,
    /// Opaque connection token; the relay resolves it to an identity.
    pub token: String,
    pub room: String,
    /// Directory where received files are materialized.
    pub downloads: PathBuf,
    /// Accept every incoming request without asking. Headless endpoints
    /// have nobody to ask.
    pub auto_accept: bool,
    /// Offer this file to this peer id once it appears in the room.
    pub outbound: Option<(String, PathBuf)>,
    pub history: Option<HistoryClient>,
}

impl EndpointConfig {
    /// The user id half of the default `"{user_id}:{username}"` token
    /// scheme; a token without a separator is used whole.
    fn local_id(&self) -> &str {
        self.token
            .split_once(':')
            .map(|(id, _)| id)
            .unwrap_or(&self.token)
    }
}

pub struct Endpoint {
    config: EndpointConfig,
    engine: TransferEngine,
    channels: HashMap<Uuid, Arc<PeerChannel>>,
    sink: WsSink,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    /// Set once the configured outbound file has been offered, so roster
    /// refreshes do not offer it again.
    outbound_requested: bool,
}

impl Endpoint {
    /// Connect to the relay, join the room, and run until cancelled or
    /// the socket drops.
    pub async fn run(config: EndpointConfig, sos: SignalOfStop) -> Result<()> {
        let url = format!(
            "{}/ws/{}",
            config.relay_url.trim_end_matches('/'),
            config.token
        );
        let (ws, _) = connect_async(&url)
            .await
            .with_context(|| format!("connecting to relay at {}", config.relay_url))?;
        info!(event = "relay_connected", room = %config.room, "Connected to relay");

        let (sink, source) = ws.split();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(config.local_id());

        let mut endpoint = Self {
            config,
            engine,
            channels: HashMap::new(),
            sink,
            events_tx,
            outbound_requested: false,
        };
        endpoint
            .send_signal(&ClientMessage::JoinRoom {
                room_id: endpoint.config.room.clone(),
            })
            .await?;
        endpoint.event_loop(source, events_rx, sos).await
    }

    async fn event_loop(
        &mut self,
        mut source: WsSource,
        mut events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        sos: SignalOfStop,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = sos.wait() => {
                    info!(event = "endpoint_shutdown", "Leaving room and closing");
                    let _ = self.send_signal(&ClientMessage::LeaveRoom).await;
                    for (_, channel) in self.channels.drain() {
                        channel.close().await;
                    }
                    return Ok(());
                }
                frame = source.next() => {
                    let Some(frame) = frame else {
                        return Err(anyhow!("relay connection closed"));
                    };
                    self.on_ws_frame(frame?).await?;
                }
                event = events_rx.recv() => {
                    // The endpoint holds a sender, so the queue never closes.
                    let Some(event) = event else { return Ok(()) };
                    let outcome = self.engine.process_channel_event(&event);
                    self.execute(outcome).await?;
                }
            }
        }
    }

    async fn on_ws_frame(&mut self, frame: Message) -> Result<()> {
        let Message::Text(text) = frame else {
            return Ok(());
        };
        let msg: ServerMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(event = "malformed_signal", error = %e, "Ignoring relay message");
                return Ok(());
            }
        };

        if let ServerMessage::RoomUsers { ref users, .. } = msg {
            info!(
                event = "roster_updated",
                peers = users.len(),
                "Room roster refreshed"
            );
            self.maybe_request_outbound(users.iter().map(|u| u.id.as_str()))
                .await?;
        }

        let outcome = self.engine.process_signal(&msg);
        self.execute(outcome).await
    }

    /// Offer the configured file once its target is present.
    async fn maybe_request_outbound(
        &mut self,
        mut present: impl Iterator<Item = &str>,
    ) -> Result<()> {
        if self.outbound_requested {
            return Ok(());
        }
        let Some((peer, path)) = self.config.outbound.clone() else {
            return Ok(());
        };
        if !present.any(|id| id == peer) {
            return Ok(());
        }

        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("outbound path has no file name"))?;

        self.outbound_requested = true;
        let outcome = self.engine.request_send(
            &peer,
            &file_name,
            meta.len(),
            "application/octet-stream",
            path,
        );
        self.execute(outcome).await
    }

    /// Execute engine actions, feeding any follow-up actions (an accepted
    /// incoming request produces its own response) back into the queue.
    async fn execute(&mut self, outcome: EngineOutcome) -> Result<()> {
        if let Some(status) = outcome.status {
            info!(event = "status", "{status}");
        }
        let mut queue: VecDeque<EngineAction> = outcome.actions.into();
        while let Some(action) = queue.pop_front() {
            if let Some(followup) = self.execute_action(action).await? {
                if let Some(status) = followup.status {
                    info!(event = "status", "{status}");
                }
                queue.extend(followup.actions);
            }
        }
        Ok(())
    }

    async fn execute_action(&mut self, action: EngineAction) -> Result<Option<EngineOutcome>> {
        match action {
            EngineAction::SendSignal(msg) => {
                self.send_signal(&msg).await?;
            }
            EngineAction::StartNegotiation {
                transfer_id,
                peer_id,
            } => {
                if let Err(e) = self.start_negotiation(transfer_id, &peer_id).await {
                    self.negotiation_failed(transfer_id, e);
                }
            }
            EngineAction::AcceptOffer {
                transfer_id,
                peer_id,
                sdp,
            } => {
                if let Err(e) = self.accept_offer(transfer_id, &peer_id, &sdp).await {
                    self.negotiation_failed(transfer_id, e);
                }
            }
            EngineAction::ApplyAnswer { transfer_id, sdp } => {
                if let Some(channel) = self.channels.get(&transfer_id) {
                    if let Err(e) = channel.set_answer(&sdp).await {
                        self.negotiation_failed(transfer_id, e);
                    }
                } else {
                    debug!(event = "answer_without_channel", transfer_id = %transfer_id);
                }
            }
            EngineAction::ApplyCandidate {
                transfer_id,
                candidate,
            } => {
                if let Some(channel) = self.channels.get(&transfer_id) {
                    channel.add_remote_candidate(&candidate).await;
                }
            }
            EngineAction::BeginSend {
                transfer_id,
                path,
                file_name,
                file_size,
                file_type,
            } => {
                let Some(channel) = self.channels.get(&transfer_id) else {
                    warn!(event = "send_without_channel", transfer_id = %transfer_id);
                    let _ = self.events_tx.send(ChannelEvent::Closed { transfer_id });
                    return Ok(None);
                };
                let dc = match channel.data_channel().await {
                    Ok(dc) => dc,
                    Err(e) => {
                        warn!(event = "send_setup_failure", transfer_id = %transfer_id, error = %e);
                        let _ = self.events_tx.send(ChannelEvent::Closed { transfer_id });
                        return Ok(None);
                    }
                };
                let events = self.events_tx.clone();
                let sender_id = self.config.local_id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = send_file(
                        dc,
                        transfer_id,
                        &path,
                        &file_name,
                        file_size,
                        &file_type,
                        &sender_id,
                        events.clone(),
                    )
                    .await
                    {
                        warn!(event = "send_failure", transfer_id = %transfer_id, error = %e);
                        let _ = events.send(ChannelEvent::Closed { transfer_id });
                    }
                });
            }
            EngineAction::CloseChannel { transfer_id } => {
                if let Some(channel) = self.channels.remove(&transfer_id) {
                    channel.close().await;
                }
            }
            EngineAction::SurfaceIncoming {
                transfer_id,
                from_username,
                file_name,
                file_size,
                ..
            } => {
                if self.config.auto_accept {
                    return Ok(Some(self.engine.accept_incoming(&transfer_id)));
                }
                // No interactive surface on a headless endpoint; the
                // request stays pending until the peer gives up.
                info!(
                    event = "incoming_pending",
                    transfer_id = %transfer_id,
                    from = %from_username,
                    file = %file_name,
                    size = file_size,
                    "Incoming request held (auto-accept disabled)"
                );
            }
            EngineAction::PersistRecord(record) => {
                if let Some(history) = &self.config.history {
                    history.persist(record);
                }
            }
        }
        Ok(None)
    }

    /// Create the initiator-side negotiation context and send the offer.
    async fn start_negotiation(&mut self, transfer_id: Uuid, peer_id: &str) -> Result<()> {
        let (channel, offer) = PeerChannel::initiate(transfer_id, self.events_tx.clone()).await?;
        let channel = Arc::new(channel);
        self.watch_open(transfer_id, channel.clone());
        self.channels.insert(transfer_id, channel);
        self.send_signal(&ClientMessage::Offer {
            target: peer_id.to_string(),
            sdp: offer,
        })
        .await
    }

    /// Ingest a remote offer as responder and send the answer back.
    async fn accept_offer(&mut self, transfer_id: Uuid, peer_id: &str, sdp: &str) -> Result<()> {
        let (channel, answer) = PeerChannel::respond(
            transfer_id,
            sdp,
            self.config.downloads.clone(),
            self.events_tx.clone(),
        )
        .await?;
        let channel = Arc::new(channel);
        self.watch_open(transfer_id, channel.clone());
        self.channels.insert(transfer_id, channel);
        self.send_signal(&ClientMessage::Answer {
            target: peer_id.to_string(),
            sdp: answer,
        })
        .await
    }

    /// A setup error scoped to one transfer fails that transfer and
    /// leaves the endpoint serving everything else. The failure event
    /// routes back through the engine, which tears the channel down.
    fn negotiation_failed(&self, transfer_id: Uuid, error: anyhow::Error) {
        warn!(
            event = "negotiation_setup_failure",
            transfer_id = %transfer_id,
            error = %error,
            "Negotiation setup failed"
        );
        let _ = self.events_tx.send(ChannelEvent::NegotiationFailed {
            transfer_id,
            reason: error.to_string(),
        });
    }

    /// Bound the open wait; expiry surfaces as a negotiation failure so
    /// the transfer fails instead of sticking in Negotiating forever.
    fn watch_open(&self, transfer_id: Uuid, channel: Arc<PeerChannel>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.wait_open().await {
                let _ = events.send(ChannelEvent::NegotiationFailed {
                    transfer_id,
                    reason: e.to_string(),
                });
            }
        });
    }

    async fn send_signal(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = serde_json::to_string(msg).context("encoding signaling message")?;
        self.sink
            .send(Message::Text(text))
            .await
            .context("sending signaling message")
    }
}

/// Build an [`EndpointConfig`] from parsed arguments; `None` when the
/// arguments do not describe endpoint mode.
pub fn endpoint_config(args: &crate::workers::args::Args) -> Option<EndpointConfig> {
    let room = args.join.clone()?;
    let token = args.token.clone()?;
    let relay_url = args
        .relay_url
        .clone()
        .unwrap_or_else(|| format!("ws://{DEFAULT_RELAY_ADDR}"));
    let history = args
        .history_url
        .as_ref()
        .map(|url| HistoryClient::new(url, args.history_token.clone().unwrap_or_default()));
    Some(EndpointConfig {
        relay_url,
        token,
        room,
        downloads: args
            .downloads
            .clone()
            .unwrap_or_else(|| PathBuf::from("downloads")),
        auto_accept: true,
        outbound: match (&args.to, &args.send) {
            (Some(peer), Some(path)) => Some((peer.clone(), path.clone())),
            _ => None,
        },
        history,
    })
}
