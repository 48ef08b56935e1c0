//! Peer-to-peer negotiation contexts and the byte channel they carry.

pub mod channel;

pub use channel::PeerChannel;
