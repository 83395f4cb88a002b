//! Host-guest filesystem server, reached through the VIX `HgfsSendPacket`
//! command.

pub mod protocol;
pub mod server;

pub use protocol::{Packet, Status, StatusCode};
pub use server::{DEFAULT_MAX_SESSIONS, Server};
