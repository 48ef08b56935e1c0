//! Room membership and presence bookkeeping for the relay.
//!
//! All state lives behind one lock in [`RoomRegistry`]; the per-connection
//! read loops in [`crate::relay::server`] call in and every mutation plus
//! its fan-out happens atomically, so no interleaving of a join and a
//! leave can produce a peer list that never existed.
//!
//! Delivery is a push onto each session's unbounded queue; a failed push
//! means the writer task is gone and the session is treated as dead.

use crate::core::signal::{ClientMessage, Identity, RoomUser, ServerMessage};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Session {
    identity: Identity,
    room: Option<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

/// All connected sessions and the rooms they occupy.
#[derive(Default)]
pub struct RoomRegistry {
    sessions: HashMap<String, Session>,
    rooms: HashMap<String, HashSet<String>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly authenticated connection. A reconnect under the
    /// same user id displaces the stale session.
    pub fn connect(&mut self, identity: Identity, tx: mpsc::UnboundedSender<ServerMessage>) {
        let user_id = identity.user_id.clone();
        if let Some(stale) = self.sessions.insert(
            user_id.clone(),
            Session {
                identity,
                room: None,
                tx,
            },
        ) {
            warn!(
                event = "session_displaced",
                user = %user_id,
                "New connection displaced an existing session"
            );
            if let Some(room) = stale.room {
                self.remove_from_room(&user_id, &room);
                self.broadcast_room_users(&room);
            }
        }
        info!(event = "session_connected", user = %user_id);
    }

    /// A session's socket is gone: implicit leave plus removal.
    pub fn disconnect(&mut self, user_id: &str) {
        let Some(session) = self.sessions.remove(user_id) else {
            return;
        };
        if let Some(room) = session.room {
            self.remove_from_room(user_id, &room);
            self.broadcast_room_users(&room);
        }
        info!(event = "session_disconnected", user = %user_id);
    }

    /// Enter a room, leaving any previous room first. The joiner gets a
    /// `room_joined` ack and every member (joiner included) gets a fresh
    /// peer list.
    pub fn join(&mut self, user_id: &str, room_id: &str) {
        let Some(session) = self.sessions.get_mut(user_id) else {
            return;
        };
        let previous = session.room.replace(room_id.to_string());
        let tx = session.tx.clone();

        if let Some(previous) = previous.filter(|r| r != room_id) {
            self.remove_from_room(user_id, &previous);
            self.broadcast_room_users(&previous);
        }

        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        info!(event = "room_joined", user = %user_id, room = %room_id);

        let _ = tx.send(ServerMessage::RoomJoined {
            room_id: room_id.to_string(),
        });
        self.broadcast_room_users(room_id);
    }

    /// Leave the current room, if any. The leaver gets a `room_left` ack
    /// and the remaining members get a fresh peer list.
    pub fn leave(&mut self, user_id: &str) {
        let Some(session) = self.sessions.get_mut(user_id) else {
            return;
        };
        let Some(room) = session.room.take() else {
            return;
        };
        let tx = session.tx.clone();

        self.remove_from_room(user_id, &room);
        info!(event = "room_left", user = %user_id, room = %room);
        let _ = tx.send(ServerMessage::RoomLeft);
        self.broadcast_room_users(&room);
    }

    /// Forward a directed signaling message: strip `target`, annotate the
    /// sender, and push onto the target's queue. An unknown target means
    /// the message is dropped; signaling has no delivery receipt.
    pub fn forward(&mut self, from_id: &str, msg: &ClientMessage) {
        let Some(target) = msg.target() else {
            return;
        };
        let Some(sender) = self.sessions.get(from_id) else {
            return;
        };
        let from = sender.identity.user_id.clone();
        let from_username = sender.identity.username.clone();

        let relayed = match msg {
            ClientMessage::Offer { sdp, .. } => ServerMessage::Offer {
                from: from.clone(),
                sdp: sdp.clone(),
            },
            ClientMessage::Answer { sdp, .. } => ServerMessage::Answer {
                from: from.clone(),
                sdp: sdp.clone(),
            },
            ClientMessage::IceCandidate { candidate, .. } => ServerMessage::IceCandidate {
                from: from.clone(),
                candidate: candidate.clone(),
            },
            ClientMessage::TransferRequest {
                file_name,
                file_size,
                file_type,
                ..
            } => ServerMessage::TransferRequest {
                from: from.clone(),
                from_username,
                file_name: file_name.clone(),
                file_size: *file_size,
                file_type: file_type.clone(),
            },
            ClientMessage::TransferResponse { accepted, .. } => ServerMessage::TransferResponse {
                from: from.clone(),
                accepted: *accepted,
            },
            ClientMessage::JoinRoom { .. } | ClientMessage::LeaveRoom => return,
        };

        let delivered = match self.sessions.get(target) {
            Some(session) => session.tx.send(relayed).is_ok(),
            None => {
                debug!(
                    event = "forward_target_missing",
                    from = %from,
                    target = %target,
                    "Dropping message for unknown target"
                );
                return;
            }
        };
        if !delivered {
            debug!(event = "dead_session_reaped", user = %target);
            let dead = target.to_string();
            self.disconnect(&dead);
        }
    }

    fn remove_from_room(&mut self, user_id: &str, room_id: &str) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(user_id);
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }
    }

    /// Send every member its own view of the room: the member list minus
    /// the recipient itself.
    fn broadcast_room_users(&mut self, room_id: &str) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        let roster: Vec<RoomUser> = members
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|s| RoomUser {
                id: s.identity.user_id.clone(),
                username: s.identity.username.clone(),
            })
            .collect();

        let mut dead = Vec::new();
        for member_id in members {
            let Some(session) = self.sessions.get(member_id) else {
                continue;
            };
            let users = roster
                .iter()
                .filter(|u| u.id != *member_id)
                .cloned()
                .collect();
            let msg = ServerMessage::RoomUsers {
                room_id: room_id.to_string(),
                users,
            };
            if session.tx.send(msg).is_err() {
                dead.push(member_id.clone());
            }
        }
        for user_id in dead {
            debug!(event = "dead_session_reaped", user = %user_id);
            self.disconnect(&user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, name: &str) -> Identity {
        Identity {
            user_id: id.into(),
            username: name.into(),
        }
    }

    fn connect(reg: &mut RoomRegistry, id: &str, name: &str) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        reg.connect(identity(id, name), tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn last_roster(msgs: &[ServerMessage]) -> Vec<String> {
        let mut ids: Vec<String> = msgs
            .iter()
            .rev()
            .find_map(|m| match m {
                ServerMessage::RoomUsers { users, .. } => {
                    Some(users.iter().map(|u| u.id.clone()).collect())
                }
                _ => None,
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    #[test]
    fn peer_list_excludes_the_recipient() {
        let mut reg = RoomRegistry::new();
        let mut alice = connect(&mut reg, "1", "alice");
        let mut bob = connect(&mut reg, "2", "bob");
        let mut carol = connect(&mut reg, "3", "carol");

        reg.join("1", "den");
        reg.join("2", "den");
        reg.join("3", "den");

        assert_eq!(last_roster(&drain(&mut alice)), vec!["2", "3"]);
        assert_eq!(last_roster(&drain(&mut bob)), vec!["1", "3"]);
        assert_eq!(last_roster(&drain(&mut carol)), vec!["1", "2"]);
    }

    #[test]
    fn join_acks_before_roster() {
        let mut reg = RoomRegistry::new();
        let mut alice = connect(&mut reg, "1", "alice");
        reg.join("1", "den");

        let msgs = drain(&mut alice);
        assert!(matches!(&msgs[0], ServerMessage::RoomJoined { room_id } if room_id == "den"));
        assert!(matches!(&msgs[1], ServerMessage::RoomUsers { users, .. } if users.is_empty()));
    }

    #[test]
    fn rejoin_moves_between_rooms() {
        let mut reg = RoomRegistry::new();
        let mut alice = connect(&mut reg, "1", "alice");
        let mut bob = connect(&mut reg, "2", "bob");

        reg.join("1", "den");
        reg.join("2", "den");
        drain(&mut alice);
        drain(&mut bob);

        reg.join("1", "attic");

        // Bob sees Alice depart; Alice joins an empty attic.
        assert_eq!(last_roster(&drain(&mut bob)), Vec::<String>::new());
        let msgs = drain(&mut alice);
        assert!(matches!(&msgs[0], ServerMessage::RoomJoined { room_id } if room_id == "attic"));
        assert_eq!(last_roster(&msgs), Vec::<String>::new());
    }

    #[test]
    fn leave_acks_and_rebroadcasts() {
        let mut reg = RoomRegistry::new();
        let mut alice = connect(&mut reg, "1", "alice");
        let mut bob = connect(&mut reg, "2", "bob");
        reg.join("1", "den");
        reg.join("2", "den");
        drain(&mut alice);
        drain(&mut bob);

        reg.leave("1");
        let msgs = drain(&mut alice);
        assert!(matches!(msgs[0], ServerMessage::RoomLeft));
        assert_eq!(last_roster(&drain(&mut bob)), Vec::<String>::new());

        // A second leave with no room is a no-op.
        reg.leave("1");
        assert!(drain(&mut alice).is_empty());
    }

    #[test]
    fn disconnect_implies_leave() {
        let mut reg = RoomRegistry::new();
        let mut alice = connect(&mut reg, "1", "alice");
        let mut bob = connect(&mut reg, "2", "bob");
        reg.join("1", "den");
        reg.join("2", "den");
        drain(&mut alice);
        drain(&mut bob);

        reg.disconnect("1");
        assert_eq!(last_roster(&drain(&mut bob)), Vec::<String>::new());
    }

    #[test]
    fn forward_annotates_sender_and_strips_target() {
        let mut reg = RoomRegistry::new();
        let _alice = connect(&mut reg, "1", "alice");
        let mut bob = connect(&mut reg, "2", "bob");

        reg.forward(
            "1",
            &ClientMessage::TransferRequest {
                target: "2".into(),
                file_name: "report.pdf".into(),
                file_size: 32768,
                file_type: "application/pdf".into(),
            },
        );

        let msgs = drain(&mut bob);
        let ServerMessage::TransferRequest {
            from,
            from_username,
            file_name,
            ..
        } = &msgs[0]
        else {
            panic!("expected transfer_request, got {msgs:?}");
        };
        assert_eq!(from, "1");
        assert_eq!(from_username, "alice");
        assert_eq!(file_name, "report.pdf");
    }

    #[test]
    fn forward_to_unknown_target_is_dropped() {
        let mut reg = RoomRegistry::new();
        let mut alice = connect(&mut reg, "1", "alice");

        reg.forward(
            "1",
            &ClientMessage::Offer {
                target: "9".into(),
                sdp: "{}".into(),
            },
        );
        assert!(drain(&mut alice).is_empty());
    }
}
