//! PeerChannel: one negotiation context and the single ordered byte
//! channel it produces.
//!
//! Each transfer gets a fresh context. The initiator creates the data
//! channel before offering so the channel rides the initial SDP; the
//! responder receives it through `on_data_channel`. Both sides trickle
//! ICE candidates through the engine as they are discovered rather than
//! waiting for gathering to complete.
//!
//! All callbacks translate transport events into [`ChannelEvent`]s on the
//! engine's queue; no transfer state lives here.

use crate::core::config::{ICE_INCLUDE_LOOPBACK, NEGOTIATION_TIMEOUT};
use crate::core::engine::ChannelEvent;
use crate::core::pipeline::frame::ControlFrame;
use crate::core::pipeline::receiver::Reassembly;
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// The label carried by every transfer's data channel.
const CHANNEL_LABEL: &str = "file";

fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".into()],
        ..Default::default()
    }]
}

async fn create_webrtc_api() -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;
    let mut se = SettingEngine::default();
    se.set_include_loopback_candidate(ICE_INCLUDE_LOOPBACK);
    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// One per-transfer negotiation context.
pub struct PeerChannel {
    transfer_id: Uuid,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    open: Arc<OpenGate>,
}

/// Open-state latch; survives the notify firing before anyone waits.
#[derive(Default)]
struct OpenGate {
    opened: AtomicBool,
    notify: Notify,
}

impl OpenGate {
    fn set(&self) {
        self.opened.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            if self.opened.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            if self.opened.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl PeerChannel {
    async fn new(
        transfer_id: Uuid,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Self> {
        let api = create_webrtc_api().await?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: default_ice_servers(),
                ..Default::default()
            })
            .await?,
        );

        // Trickle: forward each local candidate as it is discovered. A
        // `None` candidate marks end-of-gathering and is not forwarded.
        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_string(&init) {
                            Ok(json) => {
                                let _ = events.send(ChannelEvent::LocalCandidate {
                                    transfer_id,
                                    candidate: json,
                                });
                            }
                            Err(e) => warn!(event = "candidate_encode_failure", error = %e),
                        },
                        Err(e) => warn!(event = "candidate_encode_failure", error = %e),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let events = events.clone();
                Box::pin(async move {
                    match s {
                        RTCPeerConnectionState::Connected => {
                            info!(event = "peer_connected", transfer_id = %transfer_id);
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            let _ = events.send(ChannelEvent::Closed { transfer_id });
                        }
                        RTCPeerConnectionState::Disconnected => {
                            // Transient; ICE may recover without our help.
                            warn!(event = "peer_disconnected", transfer_id = %transfer_id);
                        }
                        _ => {}
                    }
                })
            }));
        }

        Ok(Self {
            transfer_id,
            pc,
            dc: Arc::new(RwLock::new(None)),
            open: Arc::new(OpenGate::default()),
        })
    }

    /// Initiator side: create the channel, offer, and return the local SDP
    /// for the signaling wire.
    pub async fn initiate(
        transfer_id: Uuid,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<(Self, String)> {
        let this = Self::new(transfer_id, events.clone()).await?;

        // Explicit ordered + fully reliable (SCTP default, no partial
        // reliability); ordering is what makes header-less framing sound.
        let dc = this
            .pc
            .create_data_channel(
                CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        this.attach_sender_handlers(&dc, events);
        *this.dc.write().await = Some(dc);

        let offer = this.pc.create_offer(None).await?;
        this.pc.set_local_description(offer.clone()).await?;
        let sdp = serde_json::to_string(&offer).context("encoding offer")?;
        debug!(event = "offer_created", transfer_id = %transfer_id);
        Ok((this, sdp))
    }

    /// Responder side: ingest the remote offer and return the local answer.
    /// Received files are materialized under `output_dir`.
    pub async fn respond(
        transfer_id: Uuid,
        offer_sdp: &str,
        output_dir: PathBuf,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<(Self, String)> {
        let this = Self::new(transfer_id, events.clone()).await?;

        {
            let dc_slot = this.dc.clone();
            let open = this.open.clone();
            pc_on_data_channel(&this.pc, move |dc| {
                let dc_slot = dc_slot.clone();
                let open = open.clone();
                let events = events.clone();
                let output_dir = output_dir.clone();
                async move {
                    attach_receiver_handlers(&dc, transfer_id, output_dir, open, events);
                    *dc_slot.write().await = Some(dc);
                }
            });
        }

        let offer: RTCSessionDescription =
            serde_json::from_str(offer_sdp).context("decoding remote offer")?;
        this.pc.set_remote_description(offer).await?;
        let answer = this.pc.create_answer(None).await?;
        this.pc.set_local_description(answer.clone()).await?;
        let sdp = serde_json::to_string(&answer).context("encoding answer")?;
        debug!(event = "answer_created", transfer_id = %transfer_id);
        Ok((this, sdp))
    }

    /// Complete the initiator side with the peer's answer.
    pub async fn set_answer(&self, answer_sdp: &str) -> Result<()> {
        let answer: RTCSessionDescription =
            serde_json::from_str(answer_sdp).context("decoding remote answer")?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    /// Ingest one remote candidate. Duplicates and stragglers arriving
    /// after the channel opens are harmless, so failures only log.
    pub async fn add_remote_candidate(&self, candidate_json: &str) {
        let init: RTCIceCandidateInit = match serde_json::from_str(candidate_json) {
            Ok(init) => init,
            Err(e) => {
                warn!(
                    event = "candidate_decode_failure",
                    transfer_id = %self.transfer_id,
                    error = %e
                );
                return;
            }
        };
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            debug!(
                event = "candidate_ignored",
                transfer_id = %self.transfer_id,
                error = %e
            );
        }
    }

    /// Wait for the data channel to reach the open state, bounded by
    /// [`NEGOTIATION_TIMEOUT`].
    pub async fn wait_open(&self) -> Result<()> {
        timeout(NEGOTIATION_TIMEOUT, self.open.wait())
            .await
            .map_err(|_| anyhow!("data channel open timeout"))
    }

    /// The open data channel, once negotiation has produced one.
    pub async fn data_channel(&self) -> Result<Arc<RTCDataChannel>> {
        self.dc
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("data channel not established"))
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(event = "peer_close_failure", transfer_id = %self.transfer_id, error = %e);
        }
    }

    fn attach_sender_handlers(
        &self,
        dc: &Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let transfer_id = self.transfer_id;
        let open = self.open.clone();
        {
            let events = events.clone();
            dc.on_open(Box::new(move || {
                let open = open.clone();
                let events = events.clone();
                Box::pin(async move {
                    info!(event = "channel_open", transfer_id = %transfer_id, role = "sender");
                    open.set();
                    let _ = events.send(ChannelEvent::Open { transfer_id });
                })
            }));
        }
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(ChannelEvent::Closed { transfer_id });
            })
        }));
    }
}

// RTCPeerConnection::on_data_channel wants a boxed fn returning a boxed
// future; this keeps the call site readable.
fn pc_on_data_channel<F, Fut>(pc: &Arc<RTCPeerConnection>, f: F)
where
    F: Fn(Arc<RTCDataChannel>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| Box::pin(f(dc))));
}

/// Wire the responder's channel callbacks: open/close notifications plus
/// the text/binary demultiplexer feeding a [`Reassembly`].
fn attach_receiver_handlers(
    dc: &Arc<RTCDataChannel>,
    transfer_id: Uuid,
    output_dir: PathBuf,
    open: Arc<OpenGate>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    {
        let events = events.clone();
        dc.on_open(Box::new(move || {
            let open = open.clone();
            let events = events.clone();
            Box::pin(async move {
                info!(event = "channel_open", transfer_id = %transfer_id, role = "receiver");
                open.set();
                let _ = events.send(ChannelEvent::Open { transfer_id });
            })
        }));
    }
    {
        let events = events.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(ChannelEvent::Closed { transfer_id });
            })
        }));
    }

    let reassembly: Arc<Mutex<Option<Reassembly>>> = Arc::new(Mutex::new(None));
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let reassembly = reassembly.clone();
        let events = events.clone();
        let output_dir = output_dir.clone();
        Box::pin(async move {
            if msg.is_string {
                let text = String::from_utf8_lossy(&msg.data);
                match ControlFrame::decode(&text) {
                    Ok(frame @ ControlFrame::FileMeta { .. }) => {
                        let mut slot = reassembly.lock().await;
                        if slot.is_some() {
                            warn!(
                                event = "duplicate_file_meta",
                                transfer_id = %transfer_id,
                                "file-meta while a buffer is active; restarting"
                            );
                        }
                        *slot = Reassembly::new(&frame);
                        let _ = events.send(ChannelEvent::MetaReceived { transfer_id });
                    }
                    Ok(ControlFrame::FileEnd {}) => {
                        let Some(buffer) = reassembly.lock().await.take() else {
                            warn!(
                                event = "file_end_without_meta",
                                transfer_id = %transfer_id
                            );
                            return;
                        };
                        finalize_to_disk(buffer, transfer_id, &output_dir, &events).await;
                    }
                    Err(e) => {
                        warn!(
                            event = "control_frame_decode_failure",
                            transfer_id = %transfer_id,
                            error = %e
                        );
                    }
                }
            } else {
                let mut slot = reassembly.lock().await;
                let Some(buffer) = slot.as_mut() else {
                    warn!(
                        event = "binary_frame_without_meta",
                        transfer_id = %transfer_id,
                        bytes = msg.data.len()
                    );
                    return;
                };
                buffer.push_segment(msg.data);
                debug!(
                    event = "segment_received",
                    transfer_id = %transfer_id,
                    bytes = buffer.bytes_received(),
                    percent = buffer.progress().percent()
                );
                let _ = events.send(ChannelEvent::ReceiveProgress {
                    transfer_id,
                    bytes_received: buffer.bytes_received(),
                    declared_size: buffer.declared_size(),
                });
            }
        })
    }));
}

async fn finalize_to_disk(
    buffer: Reassembly,
    transfer_id: Uuid,
    output_dir: &Path,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) {
    let done = buffer.finalize();
    let bytes_received = done.data.len() as u64;

    // Only the final path component of the declared name is trusted.
    let name = Path::new(&done.meta.file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("transfer-{transfer_id}"));
    let path = output_dir.join(name);

    if let Err(e) = tokio::fs::create_dir_all(output_dir).await {
        warn!(event = "download_dir_failure", path = %output_dir.display(), error = %e);
        return;
    }
    match tokio::fs::write(&path, &done.data).await {
        Ok(()) => {
            info!(
                event = "file_materialized",
                transfer_id = %transfer_id,
                path = %path.display(),
                bytes = bytes_received
            );
            let _ = events.send(ChannelEvent::ReceiveComplete {
                transfer_id,
                bytes_received,
                size_mismatch: done.size_mismatch,
            });
        }
        Err(e) => {
            warn!(
                event = "file_write_failure",
                transfer_id = %transfer_id,
                path = %path.display(),
                error = %e
            );
            let _ = events.send(ChannelEvent::Closed { transfer_id });
        }
    }
}
