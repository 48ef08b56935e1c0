//! Transfer lifecycle: one file moving one direction between two users.
//!
//! A [`Transfer`] is owned exclusively by the endpoint that created it;
//! each side of a transfer keeps its own local view and nothing here is
//! shared across endpoints.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── State machine ────────────────────────────────────────────────────────────

/// Lifecycle of one transfer attempt.
///
/// Sender path: `Requested → Negotiating → Transferring → Done`, or
/// `Requested → Rejected`, or any non-terminal state `→ Failed`.
/// Receiver path: `Requested → Negotiating` (upon the sender's offer)
/// `→ Transferring → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Request sent (sender) or surfaced for a decision (receiver).
    Requested,
    /// Handshake accepted; offer/answer/ICE exchange in flight.
    Negotiating,
    /// Byte channel open; chunk frames moving.
    Transferring,
    /// `file-end` processed and the artifact materialized (receiver), or
    /// the final slice plus `file-end` queued (sender).
    Done,
    /// Peer answered `accepted: false`. A normal outcome, not an error.
    Rejected,
    /// Negotiation timeout, channel loss before `file-end`, or local abort.
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected | Self::Failed)
    }
}

/// Which way the file moves relative to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outbound,
    Inbound,
}

// ── Progress ─────────────────────────────────────────────────────────────────

/// Monotonically non-decreasing percentage in [0, 100].
///
/// `update` never lowers the reading, so duplicate or late accounting can't
/// make a progress bar move backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress(u8);

impl Progress {
    pub fn percent(self) -> u8 {
        self.0
    }

    pub fn is_complete(self) -> bool {
        self.0 >= 100
    }

    /// Recompute from byte counts, clamped to 100 and floored at the
    /// current reading. A zero-byte total is complete by definition.
    pub fn update(&mut self, done: u64, total: u64) -> Self {
        let pct = if total == 0 {
            100
        } else {
            (done.saturating_mul(100) / total).min(100) as u8
        };
        self.0 = self.0.max(pct);
        *self
    }
}

// ── Transfer ─────────────────────────────────────────────────────────────────

/// The unit of work for one file moving from sender to receiver.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: Uuid,
    /// The remote user on the other end, whichever direction.
    pub peer_id: String,
    pub direction: Direction,
    pub file_name: String,
    pub file_size: u64,
    /// MIME string, advisory only.
    pub file_type: String,
    pub progress: Progress,
    pub state: TransferState,
    /// Source path for outbound transfers; `None` for inbound.
    pub source_path: Option<std::path::PathBuf>,
}

impl Transfer {
    pub fn new_outbound(
        peer_id: String,
        file_name: String,
        file_size: u64,
        file_type: String,
        source_path: std::path::PathBuf,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_id,
            direction: Direction::Outbound,
            file_name,
            file_size,
            file_type,
            progress: Progress::default(),
            state: TransferState::Requested,
            source_path: Some(source_path),
        }
    }

    pub fn new_inbound(
        peer_id: String,
        file_name: String,
        file_size: u64,
        file_type: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_id,
            direction: Direction::Inbound,
            file_name,
            file_size,
            file_type,
            progress: Progress::default(),
            state: TransferState::Requested,
            source_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_monotone_and_capped() {
        let mut p = Progress::default();
        assert_eq!(p.update(16384, 32768).percent(), 50);
        assert_eq!(p.update(32768, 32768).percent(), 100);
        // Late, lower accounting never moves the reading backwards.
        assert_eq!(p.update(100, 32768).percent(), 100);
        // Over-delivery stays capped.
        let mut q = Progress::default();
        assert_eq!(q.update(40000, 32768).percent(), 100);
    }

    #[test]
    fn zero_byte_file_is_immediately_complete() {
        let mut p = Progress::default();
        assert_eq!(p.update(0, 0).percent(), 100);
        assert!(p.is_complete());
    }

    #[test]
    fn terminal_states() {
        assert!(TransferState::Done.is_terminal());
        assert!(TransferState::Rejected.is_terminal());
        assert!(TransferState::Failed.is_terminal());
        assert!(!TransferState::Negotiating.is_terminal());
        assert!(!TransferState::Transferring.is_terminal());
    }
}
