//! Signaling wire protocol: the messages exchanged over each user's
//! relay connection.
//!
//! Two tagged unions share one tag set: [`ClientMessage`] is what an
//! endpoint sends up, [`ServerMessage`] is what the relay delivers down.
//! Every directed client variant carries a `target` user id; the relay
//! forwards the payload verbatim to that target, stripping `target` and
//! annotating the true sender as `from`. The relay never inspects or
//! mutates any other field.

use serde::{Deserialize, Serialize};

// ── Identity ─────────────────────────────────────────────────────────────────

/// An authenticated user, as resolved from the connection token.
///
/// Supplied by the external auth collaborator; immutable for the lifetime
/// of the connection it was resolved for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// One member of a room, as listed in a `room_users` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    pub id: String,
    pub username: String,
}

// ── Client → relay ───────────────────────────────────────────────────────────

/// Messages an endpoint sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room, implicitly leaving any current one.
    JoinRoom { room_id: String },
    /// Leave the current room.
    LeaveRoom,
    /// SDP offer for the targeted peer.
    Offer { target: String, sdp: String },
    /// SDP answer for the targeted peer.
    Answer { target: String, sdp: String },
    /// ICE candidate for the targeted peer (trickle; any order, any count).
    IceCandidate { target: String, candidate: String },
    /// Ask the targeted peer to accept a file.
    TransferRequest {
        target: String,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    /// Accept or reject a previously received transfer request.
    TransferResponse { target: String, accepted: bool },
}

impl ClientMessage {
    /// Target user id of a directed variant, `None` for room ops.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::JoinRoom { .. } | Self::LeaveRoom => None,
            Self::Offer { target, .. }
            | Self::Answer { target, .. }
            | Self::IceCandidate { target, .. }
            | Self::TransferRequest { target, .. }
            | Self::TransferResponse { target, .. } => Some(target),
        }
    }
}

// ── Relay → client ───────────────────────────────────────────────────────────

/// Messages the relay delivers to an endpoint.
///
/// Directed variants are the client's payloads forwarded verbatim with the
/// sender id substituted for the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Membership snapshot for the recipient's room, excluding the
    /// recipient itself.
    RoomUsers {
        room_id: String,
        users: Vec<RoomUser>,
    },
    /// Acknowledgment that the recipient's join took effect.
    RoomJoined { room_id: String },
    /// Acknowledgment that the recipient's leave took effect.
    RoomLeft,
    Offer { from: String, sdp: String },
    Answer { from: String, sdp: String },
    IceCandidate { from: String, candidate: String },
    TransferRequest {
        from: String,
        from_username: String,
        file_name: String,
        file_size: u64,
        file_type: String,
    },
    TransferResponse { from: String, accepted: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_tags_match_wire_protocol() {
        let msg = ClientMessage::TransferRequest {
            target: "2".into(),
            file_name: "report.pdf".into(),
            file_size: 32768,
            file_type: "application/pdf".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transfer_request");
        assert_eq!(json["target"], "2");
        assert_eq!(json["file_size"], 32768);

        let ice = ClientMessage::IceCandidate {
            target: "2".into(),
            candidate: "{}".into(),
        };
        assert_eq!(
            serde_json::to_value(&ice).unwrap()["type"],
            "ice_candidate"
        );
    }

    #[test]
    fn server_round_trip() {
        let msg = ServerMessage::RoomUsers {
            room_id: "lobby".into(),
            users: vec![RoomUser {
                id: "1".into(),
                username: "alice".into(),
            }],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::RoomUsers { room_id, users } => {
                assert_eq!(room_id, "lobby");
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].id, "1");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn directed_variants_expose_target() {
        let msg = ClientMessage::Offer {
            target: "7".into(),
            sdp: "v=0".into(),
        };
        assert_eq!(msg.target(), Some("7"));
        assert_eq!(ClientMessage::LeaveRoom.target(), None);
    }
}
