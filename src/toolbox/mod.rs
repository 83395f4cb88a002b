//! In-guest agent speaking the hypervisor backdoor RPC protocols.
//!
//! ```text
//!   host ──poll──▶ in channel ──▶ Service ──"Vix_1_Relayed_Command"──▶ CommandServer
//!                                    │                                   ├── ProcessManager
//!                                    │                                   └── hgfs::Server
//!   host ◀──────── out channel ◀─────┘ (info-set, capabilities)
//! ```
//!
//! The backdoor transport itself lives behind [`Channel`]; everything above
//! it is plain byte framing and runs the same against [`MemoryChannel`].

pub mod channel;
pub mod command;
pub mod hgfs;
pub mod process;
pub mod service;
pub mod vix;

use std::mem::size_of;

use thiserror::Error;
use zerocopy::FromBytes;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use channel::{Channel, ChannelOut, MemoryChannel};
pub use command::CommandServer;
pub use process::{Process, ProcessError, ProcessManager, ProcessState};
pub use service::{RunningService, Service, ServiceSettings};

/// Malformed or rejected traffic on a backdoor channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid message header")]
    InvalidHeader,

    #[error("invalid message body: {0}")]
    InvalidBody(String),

    #[error("empty request")]
    EmptyRequest,

    #[error("channel not started")]
    NotStarted,

    #[error("no reply to {0:?}")]
    NoReply(String),

    #[error("request {request:?} rejected: {reply:?}")]
    Rejected { request: String, reply: String },
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::NotStarted | ProtocolError::NoReply(_) | ProtocolError::Rejected { .. } => {
                Error::Fabric(err.to_string())
            }
            _ => Error::InvalidArgument(err.to_string()),
        }
    }
}

/// Split a fixed-size wire struct off the front of `data`.
pub(crate) fn read_prefix<T: FromBytes>(data: &[u8]) -> Result<(T, &[u8]), ProtocolError> {
    let need = size_of::<T>();
    let value = T::read_from_prefix(data).ok_or(ProtocolError::Truncated {
        need,
        have: data.len(),
    })?;
    Ok((value, &data[need..]))
}

/// Split `len` bytes off the front of `data`.
pub(crate) fn take(data: &[u8], len: usize) -> Result<(&[u8], &[u8]), ProtocolError> {
    if data.len() < len {
        return Err(ProtocolError::Truncated {
            need: len,
            have: data.len(),
        });
    }
    Ok(data.split_at(len))
}
