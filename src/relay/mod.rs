//! The signaling relay: room membership plus directed message forwarding.

pub mod registry;
pub mod server;

pub use registry::RoomRegistry;
pub use server::{Authenticator, RelayServer, TokenAuthenticator};
