//! Peerdrop: room-based peer-to-peer file transfer.
//!
//! Two halves share this crate:
//!
//! - [`relay`] — the signaling relay server: room membership bookkeeping and
//!   verbatim forwarding of negotiation/handshake messages by target user id.
//!   It never touches file content.
//! - [`core`] + [`workers`] — the endpoint: transfer handshake state machine,
//!   WebRTC negotiation, and the chunked file-transfer protocol over one
//!   ordered reliable data channel per accepted transfer.

pub mod core;
pub mod relay;
pub mod utils;
pub mod workers;
