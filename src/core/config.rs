//! Centralized configuration constants for Peerdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format shapes (signaling tags, control-frame
//! JSON) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// File slice size in bytes (16 KB).
///
/// Every binary frame carries at most this many bytes; the last slice of a
/// file may be shorter. 16 KB sits comfortably under the 64 KB SCTP receive
/// buffer webrtc-rs uses by default, so no max-message-size negotiation is
/// needed.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// High water mark for the data channel's SCTP send buffer (bytes).
///
/// Before queuing the next slice the sender waits until `buffered_amount`
/// plus the slice fits under this bound, so a fast disk cannot pile
/// unbounded chunk data into the transport on a slow link.
pub const SEND_BUFFER_HIGH_WATER: usize = 1024 * 1024;

/// Poll interval while waiting for the send buffer to drain.
pub const SEND_BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on one backpressure wait before the send is abandoned.
pub const SEND_BUFFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

// ── Negotiation ──────────────────────────────────────────────────────────────

/// Bound on the wait for the data channel to reach the open state after
/// negotiation starts. Expiry abandons the attempt; there is no retry.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Include loopback ICE candidates so two endpoints on one host can pair.
pub const ICE_INCLUDE_LOOPBACK: bool = true;

// ── Admission control ────────────────────────────────────────────────────────

/// Maximum non-terminal transfers per remote peer.
///
/// The signaling wire keys offer/answer/ice_candidate by peer, not by
/// transfer, so one in-flight transfer per peer pair is what keeps that
/// mapping unambiguous.
pub const MAX_TRANSFERS_PER_PEER: usize = 1;

/// Maximum non-terminal transfers across all peers at one endpoint.
pub const MAX_CONCURRENT_TRANSFERS: usize = 8;

// ── Relay ────────────────────────────────────────────────────────────────────

/// Default TCP bind address for the relay server.
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8000";

/// WebSocket close code sent when a connection token fails to resolve.
pub const CLOSE_POLICY_UNAUTHORIZED: u16 = 4001;
