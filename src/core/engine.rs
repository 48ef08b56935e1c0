//! TransferEngine: sole coordinator of transfer handshake and lifecycle.
//!
//! This is the single source of truth for:
//! - the request → accept/reject handshake gating negotiation
//! - per-transfer lifecycle state (§ [`TransferState`])
//! - offer authorization (only peers we accepted may open a channel)
//! - admission control (explicit rule, not a side effect of shared state)
//!
//! **Architecture rule**: the engine is a pure state machine. It performs
//! no I/O and holds no sockets or channels; every side effect is returned
//! as an [`EngineAction`] for the driver ([`crate::workers::endpoint`]) to
//! execute. Signaling messages and byte-channel events are both funneled
//! through here as explicit steps.

use crate::core::config::{MAX_CONCURRENT_TRANSFERS, MAX_TRANSFERS_PER_PEER};
use crate::core::history::TransferRecord;
use crate::core::signal::{ClientMessage, ServerMessage};
use crate::core::transfer::{Direction, Transfer, TransferState};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Engine actions ───────────────────────────────────────────────────────────

/// Side effects the engine instructs the driver to execute.
#[derive(Debug, Clone)]
pub enum EngineAction {
    /// Send a message up the signaling connection.
    SendSignal(ClientMessage),
    /// Create a negotiation context as initiator and send the offer.
    StartNegotiation { transfer_id: Uuid, peer_id: String },
    /// Ingest a remote offer as responder and send the answer.
    AcceptOffer {
        transfer_id: Uuid,
        peer_id: String,
        sdp: String,
    },
    /// Complete the initiator side with the peer's answer.
    ApplyAnswer { transfer_id: Uuid, sdp: String },
    /// Ingest one remote ICE candidate.
    ApplyCandidate { transfer_id: Uuid, candidate: String },
    /// Byte channel is open: stream the file.
    BeginSend {
        transfer_id: Uuid,
        path: PathBuf,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    /// Tear down the negotiation context and channel for a transfer.
    CloseChannel { transfer_id: Uuid },
    /// Surface an incoming request for the local user's decision.
    SurfaceIncoming {
        transfer_id: Uuid,
        from: String,
        from_username: String,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    /// Fire-and-forget the completed-transfer record to the collaborator.
    PersistRecord(TransferRecord),
}

/// Result of any engine operation: actions to execute plus an optional
/// user-facing status line.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    pub actions: Vec<EngineAction>,
    pub status: Option<String>,
}

impl EngineOutcome {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            actions: Vec::new(),
            status: Some(status.into()),
        }
    }
}

// ── Channel events ───────────────────────────────────────────────────────────

/// Events delivered from the negotiation/pipeline layer to the engine.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The byte channel for a transfer reached the open state.
    Open { transfer_id: Uuid },
    /// The channel closed or the peer connection dropped.
    Closed { transfer_id: Uuid },
    /// Negotiation failed (timeout or transport error) before open.
    NegotiationFailed { transfer_id: Uuid, reason: String },
    /// A local ICE candidate was discovered and must reach the peer.
    LocalCandidate { transfer_id: Uuid, candidate: String },
    /// Sender-side slice accounting.
    SendProgress {
        transfer_id: Uuid,
        bytes_sent: u64,
        file_size: u64,
    },
    /// All slices plus `file-end` queued on the channel.
    SendComplete { transfer_id: Uuid },
    /// Receiver saw `file-meta`; the transfer is now moving bytes.
    MetaReceived { transfer_id: Uuid },
    /// Receiver-side byte accounting.
    ReceiveProgress {
        transfer_id: Uuid,
        bytes_received: u64,
        declared_size: u64,
    },
    /// Receiver processed `file-end` and materialized the artifact.
    ReceiveComplete {
        transfer_id: Uuid,
        bytes_received: u64,
        size_mismatch: bool,
    },
}

// ── TransferEngine ───────────────────────────────────────────────────────────

pub struct TransferEngine {
    /// Our stable user id (the `senderId` of outbound metadata and the
    /// `receiver_id` of inbound records).
    local_id: String,
    /// Non-terminal transfers, keyed by transfer id. Reaching a terminal
    /// state retires the transfer to `finished`, so a late event for its
    /// id no longer resolves to anything active.
    transfers: HashMap<Uuid, Transfer>,
    /// Terminal transfers, kept for listing and lookup only.
    finished: Vec<Transfer>,
    /// Inbound transfers we have answered `accepted: true` for. Only
    /// offers matching one of these are processed; anything else is an
    /// unsolicited offer and is dropped.
    authorized_inbound: HashSet<Uuid>,
}

impl TransferEngine {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            transfers: HashMap::new(),
            finished: Vec::new(),
            authorized_inbound: HashSet::new(),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn get(&self, id: &Uuid) -> Option<&Transfer> {
        self.transfers
            .get(id)
            .or_else(|| self.finished.iter().rev().find(|t| t.id == *id))
    }

    pub fn active_count(&self) -> usize {
        self.transfers.len()
    }

    fn active_count_for_peer(&self, peer_id: &str) -> usize {
        self.transfers
            .values()
            .filter(|t| t.peer_id == peer_id)
            .count()
    }

    /// The one non-terminal transfer bound to `peer_id`, if any.
    ///
    /// Admission control guarantees at most one, which is what lets the
    /// peer-keyed signaling wire address transfer-keyed state.
    fn active_for_peer_mut(&mut self, peer_id: &str) -> Option<&mut Transfer> {
        self.transfers.values_mut().find(|t| t.peer_id == peer_id)
    }

    fn admit(&self, peer_id: &str) -> Result<(), String> {
        if self.active_count_for_peer(peer_id) >= MAX_TRANSFERS_PER_PEER {
            return Err(format!("a transfer with {peer_id} is already in flight"));
        }
        if self.active_count() >= MAX_CONCURRENT_TRANSFERS {
            return Err(format!(
                "maximum concurrent transfers ({MAX_CONCURRENT_TRANSFERS}) reached"
            ));
        }
        Ok(())
    }

    /// Move a terminal transfer out of the active set. This frees its
    /// admission slot and revokes any pending offer authorization.
    fn retire(&mut self, id: &Uuid) {
        self.authorized_inbound.remove(id);
        if let Some(transfer) = self.transfers.remove(id) {
            debug_assert!(transfer.state.is_terminal());
            self.finished.push(transfer);
        }
    }

    // ── Local commands ───────────────────────────────────────────────────

    /// Start the sender side: record a pending transfer and emit the
    /// `transfer_request`.
    pub fn request_send(
        &mut self,
        peer_id: &str,
        file_name: &str,
        file_size: u64,
        file_type: &str,
        source_path: PathBuf,
    ) -> EngineOutcome {
        if let Err(reason) = self.admit(peer_id) {
            warn!(event = "transfer_admission_denied", peer = %peer_id, %reason);
            return EngineOutcome::with_status(format!("Cannot send: {reason}"));
        }

        let transfer = Transfer::new_outbound(
            peer_id.to_string(),
            file_name.to_string(),
            file_size,
            file_type.to_string(),
            source_path,
        );
        let id = transfer.id;
        info!(
            event = "transfer_requested",
            transfer_id = %id,
            peer = %peer_id,
            file = %file_name,
            size = file_size,
            "Outbound transfer requested"
        );
        self.transfers.insert(id, transfer);

        EngineOutcome {
            actions: vec![EngineAction::SendSignal(ClientMessage::TransferRequest {
                target: peer_id.to_string(),
                file_name: file_name.to_string(),
                file_size,
                file_type: file_type.to_string(),
            })],
            status: Some(format!("Requested transfer of {file_name}")),
        }
    }

    /// Accept a surfaced incoming request. Authorizes the sender's
    /// upcoming offer and answers `accepted: true`.
    pub fn accept_incoming(&mut self, transfer_id: &Uuid) -> EngineOutcome {
        let Some(transfer) = self.transfers.get(transfer_id) else {
            return EngineOutcome::with_status("No such pending transfer");
        };
        if transfer.direction != Direction::Inbound
            || transfer.state != TransferState::Requested
        {
            return EngineOutcome::with_status("Transfer is not awaiting a decision");
        }

        let peer_id = transfer.peer_id.clone();
        let file_name = transfer.file_name.clone();
        self.authorized_inbound.insert(*transfer_id);
        info!(
            event = "transfer_accepted",
            transfer_id = %transfer_id,
            peer = %peer_id,
            "Incoming transfer accepted"
        );

        EngineOutcome {
            actions: vec![EngineAction::SendSignal(ClientMessage::TransferResponse {
                target: peer_id,
                accepted: true,
            })],
            status: Some(format!("Accepted {file_name}")),
        }
    }

    /// Reject a surfaced incoming request. Terminal; no negotiation
    /// message will ever follow for this transfer.
    pub fn reject_incoming(&mut self, transfer_id: &Uuid) -> EngineOutcome {
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            return EngineOutcome::with_status("No such pending transfer");
        };
        if transfer.direction != Direction::Inbound
            || transfer.state != TransferState::Requested
        {
            return EngineOutcome::with_status("Transfer is not awaiting a decision");
        }

        transfer.state = TransferState::Rejected;
        let peer_id = transfer.peer_id.clone();
        let file_name = transfer.file_name.clone();
        info!(
            event = "transfer_rejected",
            transfer_id = %transfer_id,
            peer = %peer_id,
            "Incoming transfer rejected by user"
        );
        self.retire(transfer_id);

        EngineOutcome {
            actions: vec![EngineAction::SendSignal(ClientMessage::TransferResponse {
                target: peer_id,
                accepted: false,
            })],
            status: Some(format!("Rejected {file_name}")),
        }
    }

    // ── Signaling events ─────────────────────────────────────────────────

    /// Process one message delivered by the relay. Room bookkeeping
    /// variants are not the engine's concern and return empty.
    pub fn process_signal(&mut self, msg: &ServerMessage) -> EngineOutcome {
        match msg {
            ServerMessage::TransferRequest {
                from,
                from_username,
                file_name,
                file_size,
                file_type,
            } => self.on_transfer_request(from, from_username, file_name, *file_size, file_type),
            ServerMessage::TransferResponse { from, accepted } => {
                self.on_transfer_response(from, *accepted)
            }
            ServerMessage::Offer { from, sdp } => self.on_offer(from, sdp),
            ServerMessage::Answer { from, sdp } => self.on_answer(from, sdp),
            ServerMessage::IceCandidate { from, candidate } => self.on_candidate(from, candidate),
            ServerMessage::RoomUsers { .. }
            | ServerMessage::RoomJoined { .. }
            | ServerMessage::RoomLeft => EngineOutcome::empty(),
        }
    }

    fn on_transfer_request(
        &mut self,
        from: &str,
        from_username: &str,
        file_name: &str,
        file_size: u64,
        file_type: &str,
    ) -> EngineOutcome {
        if let Err(reason) = self.admit(from) {
            warn!(
                event = "transfer_request_refused",
                peer = %from,
                %reason,
                "Refusing incoming transfer request"
            );
            return EngineOutcome {
                actions: vec![EngineAction::SendSignal(ClientMessage::TransferResponse {
                    target: from.to_string(),
                    accepted: false,
                })],
                status: Some(format!("Refused request from {from_username}: {reason}")),
            };
        }

        let transfer = Transfer::new_inbound(
            from.to_string(),
            file_name.to_string(),
            file_size,
            file_type.to_string(),
        );
        let id = transfer.id;
        info!(
            event = "transfer_request_received",
            transfer_id = %id,
            peer = %from,
            file = %file_name,
            size = file_size,
            "Incoming transfer request"
        );
        self.transfers.insert(id, transfer);

        EngineOutcome {
            actions: vec![EngineAction::SurfaceIncoming {
                transfer_id: id,
                from: from.to_string(),
                from_username: from_username.to_string(),
                file_name: file_name.to_string(),
                file_size,
                file_type: file_type.to_string(),
            }],
            status: Some(format!("{from_username} wants to send {file_name}")),
        }
    }

    fn on_transfer_response(&mut self, from: &str, accepted: bool) -> EngineOutcome {
        let Some(transfer) = self.active_for_peer_mut(from) else {
            warn!(event = "stray_transfer_response", peer = %from, accepted);
            return EngineOutcome::empty();
        };
        if transfer.direction != Direction::Outbound
            || transfer.state != TransferState::Requested
        {
            warn!(
                event = "unexpected_transfer_response",
                transfer_id = %transfer.id,
                state = ?transfer.state,
                accepted
            );
            return EngineOutcome::empty();
        }

        let id = transfer.id;
        let file_name = transfer.file_name.clone();
        if accepted {
            transfer.state = TransferState::Negotiating;
            info!(
                event = "transfer_peer_accepted",
                transfer_id = %id,
                peer = %from,
                "Peer accepted; starting negotiation"
            );
            EngineOutcome {
                actions: vec![EngineAction::StartNegotiation {
                    transfer_id: id,
                    peer_id: from.to_string(),
                }],
                status: Some(format!("Peer accepted {file_name}; connecting...")),
            }
        } else {
            transfer.state = TransferState::Rejected;
            info!(
                event = "transfer_peer_rejected",
                transfer_id = %id,
                peer = %from,
                "Peer rejected transfer"
            );
            self.retire(&id);
            EngineOutcome::with_status(format!("Transfer of {file_name} was declined"))
        }
    }

    fn on_offer(&mut self, from: &str, sdp: &str) -> EngineOutcome {
        let authorized = self.authorized_inbound.clone();
        let Some(transfer) = self
            .transfers
            .values_mut()
            .find(|t| {
                t.peer_id == from
                    && t.direction == Direction::Inbound
                    && t.state == TransferState::Requested
                    && authorized.contains(&t.id)
            })
        else {
            warn!(
                event = "unsolicited_offer_dropped",
                peer = %from,
                "Offer without a matching accepted transfer"
            );
            return EngineOutcome::empty();
        };

        transfer.state = TransferState::Negotiating;
        let id = transfer.id;
        debug!(event = "offer_received", transfer_id = %id, peer = %from);
        EngineOutcome {
            actions: vec![EngineAction::AcceptOffer {
                transfer_id: id,
                peer_id: from.to_string(),
                sdp: sdp.to_string(),
            }],
            status: None,
        }
    }

    fn on_answer(&mut self, from: &str, sdp: &str) -> EngineOutcome {
        let Some(transfer) = self.active_for_peer_mut(from) else {
            warn!(event = "stray_answer", peer = %from);
            return EngineOutcome::empty();
        };
        if transfer.direction != Direction::Outbound
            || transfer.state != TransferState::Negotiating
        {
            warn!(
                event = "unexpected_answer",
                transfer_id = %transfer.id,
                state = ?transfer.state
            );
            return EngineOutcome::empty();
        }
        let id = transfer.id;
        debug!(event = "answer_received", transfer_id = %id, peer = %from);
        EngineOutcome {
            actions: vec![EngineAction::ApplyAnswer {
                transfer_id: id,
                sdp: sdp.to_string(),
            }],
            status: None,
        }
    }

    fn on_candidate(&mut self, from: &str, candidate: &str) -> EngineOutcome {
        // Candidates may arrive in any order, any number of times, until
        // (and harmlessly after) the channel opens; ingestion itself is
        // idempotent in the channel layer.
        let Some(transfer) = self.active_for_peer_mut(from) else {
            debug!(event = "stray_candidate_dropped", peer = %from);
            return EngineOutcome::empty();
        };
        if !matches!(
            transfer.state,
            TransferState::Negotiating | TransferState::Transferring
        ) {
            return EngineOutcome::empty();
        }
        EngineOutcome {
            actions: vec![EngineAction::ApplyCandidate {
                transfer_id: transfer.id,
                candidate: candidate.to_string(),
            }],
            status: None,
        }
    }

    // ── Channel events ───────────────────────────────────────────────────

    pub fn process_channel_event(&mut self, event: &ChannelEvent) -> EngineOutcome {
        match event {
            ChannelEvent::Open { transfer_id } => self.on_channel_open(transfer_id),
            ChannelEvent::Closed { transfer_id } => self.on_channel_closed(transfer_id),
            ChannelEvent::NegotiationFailed {
                transfer_id,
                reason,
            } => self.on_negotiation_failed(transfer_id, reason),
            ChannelEvent::LocalCandidate {
                transfer_id,
                candidate,
            } => {
                let Some(transfer) = self.transfers.get(transfer_id) else {
                    return EngineOutcome::empty();
                };
                EngineOutcome {
                    actions: vec![EngineAction::SendSignal(ClientMessage::IceCandidate {
                        target: transfer.peer_id.clone(),
                        candidate: candidate.clone(),
                    })],
                    status: None,
                }
            }
            ChannelEvent::SendProgress {
                transfer_id,
                bytes_sent,
                file_size,
            } => {
                if let Some(t) = self.transfers.get_mut(transfer_id) {
                    t.progress.update(*bytes_sent, *file_size);
                }
                EngineOutcome::empty()
            }
            ChannelEvent::SendComplete { transfer_id } => self.on_send_complete(transfer_id),
            ChannelEvent::MetaReceived { transfer_id } => {
                if let Some(t) = self.transfers.get_mut(transfer_id) {
                    if t.state == TransferState::Negotiating {
                        t.state = TransferState::Transferring;
                    }
                }
                EngineOutcome::empty()
            }
            ChannelEvent::ReceiveProgress {
                transfer_id,
                bytes_received,
                declared_size,
            } => {
                if let Some(t) = self.transfers.get_mut(transfer_id) {
                    t.progress.update(*bytes_received, *declared_size);
                }
                EngineOutcome::empty()
            }
            ChannelEvent::ReceiveComplete {
                transfer_id,
                bytes_received,
                size_mismatch,
            } => self.on_receive_complete(transfer_id, *bytes_received, *size_mismatch),
        }
    }

    fn on_channel_open(&mut self, transfer_id: &Uuid) -> EngineOutcome {
        // A late open for a retired transfer resolves to nothing: the id is
        // no longer in the active set, so nothing restarts.
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            debug!(event = "stale_channel_open", transfer_id = %transfer_id);
            return EngineOutcome::empty();
        };
        match transfer.direction {
            Direction::Outbound => {
                let Some(path) = transfer.source_path.clone() else {
                    warn!(event = "source_path_missing", transfer_id = %transfer_id);
                    transfer.state = TransferState::Failed;
                    self.retire(transfer_id);
                    return EngineOutcome {
                        actions: vec![EngineAction::CloseChannel {
                            transfer_id: *transfer_id,
                        }],
                        status: Some("Internal error: source path not found".into()),
                    };
                };
                transfer.state = TransferState::Transferring;
                info!(
                    event = "channel_open",
                    transfer_id = %transfer_id,
                    direction = "outbound",
                    "Byte channel open; streaming file"
                );
                EngineOutcome {
                    actions: vec![EngineAction::BeginSend {
                        transfer_id: *transfer_id,
                        path,
                        file_name: transfer.file_name.clone(),
                        file_size: transfer.file_size,
                        file_type: transfer.file_type.clone(),
                    }],
                    status: Some(format!("Sending {}...", transfer.file_name)),
                }
            }
            Direction::Inbound => {
                // Receiver stays in Negotiating until file-meta arrives.
                debug!(event = "channel_open", transfer_id = %transfer_id, direction = "inbound");
                EngineOutcome::empty()
            }
        }
    }

    fn on_channel_closed(&mut self, transfer_id: &Uuid) -> EngineOutcome {
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            return EngineOutcome::empty();
        };
        // A close before file-end is an incomplete transfer; the peer has
        // no positive signal of why.
        transfer.state = TransferState::Failed;
        let file_name = transfer.file_name.clone();
        warn!(
            event = "transfer_aborted",
            transfer_id = %transfer_id,
            file = %file_name,
            "Channel closed mid-transfer"
        );
        self.retire(transfer_id);
        EngineOutcome {
            actions: vec![EngineAction::CloseChannel {
                transfer_id: *transfer_id,
            }],
            status: Some(format!("Transfer of {file_name} failed: connection lost")),
        }
    }

    fn on_negotiation_failed(&mut self, transfer_id: &Uuid, reason: &str) -> EngineOutcome {
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            return EngineOutcome::empty();
        };
        transfer.state = TransferState::Failed;
        let file_name = transfer.file_name.clone();
        warn!(
            event = "negotiation_failed",
            transfer_id = %transfer_id,
            %reason,
            "Negotiation abandoned"
        );
        self.retire(transfer_id);
        EngineOutcome {
            actions: vec![EngineAction::CloseChannel {
                transfer_id: *transfer_id,
            }],
            status: Some(format!("Could not connect for {file_name}: {reason}")),
        }
    }

    fn on_send_complete(&mut self, transfer_id: &Uuid) -> EngineOutcome {
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            return EngineOutcome::empty();
        };
        transfer.progress.update(transfer.file_size, transfer.file_size);
        transfer.state = TransferState::Done;
        let file_name = transfer.file_name.clone();
        info!(
            event = "transfer_sent",
            transfer_id = %transfer_id,
            file = %file_name,
            "Outbound transfer complete"
        );
        self.retire(transfer_id);
        EngineOutcome {
            actions: vec![EngineAction::CloseChannel {
                transfer_id: *transfer_id,
            }],
            status: Some(format!("Sent {file_name}")),
        }
    }

    fn on_receive_complete(
        &mut self,
        transfer_id: &Uuid,
        bytes_received: u64,
        size_mismatch: bool,
    ) -> EngineOutcome {
        let local_id = self.local_id.clone();
        let Some(transfer) = self.transfers.get_mut(transfer_id) else {
            return EngineOutcome::empty();
        };
        transfer.progress.update(bytes_received, transfer.file_size);
        transfer.state = TransferState::Done;
        let file_name = transfer.file_name.clone();
        info!(
            event = "transfer_received",
            transfer_id = %transfer_id,
            file = %file_name,
            bytes = bytes_received,
            size_mismatch,
            "Inbound transfer complete"
        );

        let record = TransferRecord {
            file_name: file_name.clone(),
            file_size: transfer.file_size,
            file_type: transfer.file_type.clone(),
            sender_id: transfer.peer_id.clone(),
            receiver_id: local_id,
        };
        self.retire(transfer_id);
        EngineOutcome {
            actions: vec![
                EngineAction::PersistRecord(record),
                EngineAction::CloseChannel {
                    transfer_id: *transfer_id,
                },
            ],
            status: Some(format!("Received {file_name}")),
        }
    }
}
