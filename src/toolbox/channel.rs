//! Backdoor RPC channels.
//!
//! A channel is a message pipe to the hypervisor: the host polls the guest
//! on the inbound channel, the guest pushes requests on the outbound one and
//! reads a one-line status back (`1 <body>` on success, `0 <body>` on
//! failure).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::toolbox::ProtocolError;

const REPLY_OK: &[u8] = b"1 ";

pub trait Channel: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// The next pending message, or `None` when there is nothing to read.
    fn receive(&mut self) -> Result<Option<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// Outbound requests
// ---------------------------------------------------------------------------

/// Shared outbound channel. Each request is a send followed by one receive,
/// serialized across clones.
#[derive(Clone)]
pub struct ChannelOut {
    channel: Arc<Mutex<Box<dyn Channel>>>,
}

impl fmt::Debug for ChannelOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOut").finish_non_exhaustive()
    }
}

impl ChannelOut {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Channel>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> Result<()> {
        self.lock().start()
    }

    pub fn stop(&self) -> Result<()> {
        self.lock().stop()
    }

    /// Send `request` and return the body of a successful reply.
    pub fn request(&self, request: &[u8]) -> Result<Vec<u8>> {
        if request.is_empty() {
            return Err(ProtocolError::EmptyRequest.into());
        }
        let text = String::from_utf8_lossy(request).into_owned();

        let reply = {
            let mut channel = self.lock();
            channel.send(request)?;
            channel.receive()?
        };
        let reply = reply.ok_or_else(|| ProtocolError::NoReply(text.clone()))?;

        match reply.strip_prefix(REPLY_OK) {
            Some(body) => {
                debug!(request = %text, "out request ok");
                Ok(body.to_vec())
            }
            None => {
                let reply = String::from_utf8_lossy(&reply).into_owned();
                warn!(request = %text, %reply, "out request rejected");
                Err(ProtocolError::Rejected { request: text, reply }.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory channel
// ---------------------------------------------------------------------------

type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    started: bool,
    fail_start: bool,
    pending: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    responder: Option<Responder>,
}

/// Channel backed by in-process queues. Clones share the queues, so a test
/// or a local host emulation can feed requests and inspect replies while the
/// service owns the channel.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message sent on the channel queues `respond(message)` for the
    /// next receive.
    pub fn with_responder(respond: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        let channel = Self::new();
        channel.lock().responder = Some(Arc::new(respond));
        channel
    }

    /// A channel whose `start` always fails.
    pub fn failing() -> Self {
        let channel = Self::new();
        channel.lock().fail_start = true;
        channel
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a message for the channel owner to receive.
    pub fn push(&self, data: impl Into<Vec<u8>>) {
        self.lock().pending.push_back(data.into());
    }

    /// Messages sent by the channel owner so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }
}

impl Channel for MemoryChannel {
    fn start(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.fail_start {
            return Err(Error::Fabric("channel open failed".into()));
        }
        state.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.lock().started = false;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if !state.started {
            return Err(ProtocolError::NotStarted.into());
        }
        state.sent.push(data.to_vec());
        if let Some(respond) = state.responder.clone() {
            state.pending.push_back(respond(data));
        }
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        let mut state = self.lock();
        if !state.started {
            return Err(ProtocolError::NotStarted.into());
        }
        Ok(state.pending.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn started(channel: &MemoryChannel) -> ChannelOut {
        let out = ChannelOut::new(Box::new(channel.clone()));
        out.start().unwrap();
        out
    }

    #[test]
    fn request_strips_the_ok_prefix() {
        let channel = MemoryChannel::with_responder(|_| b"1 value".to_vec());
        let out = started(&channel);

        assert_eq!(out.request(b"info-get foo").unwrap(), b"value");
        assert_eq!(channel.sent(), vec![b"info-get foo".to_vec()]);
    }

    #[test]
    fn request_failures() {
        let channel = MemoryChannel::with_responder(|_| b"0 no such key".to_vec());
        let out = started(&channel);
        let err = out.request(b"info-get foo").unwrap_err();
        assert!(matches!(err, Error::Fabric(_)), "got: {err:?}");

        let err = out.request(b"").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "got: {err:?}");

        // no responder: nothing to read back
        let out = started(&MemoryChannel::new());
        assert!(out.request(b"ping").is_err());
    }

    #[test]
    fn closed_channel_rejects_io() {
        let mut channel = MemoryChannel::new();
        assert!(channel.send(b"x").is_err());
        assert!(channel.receive().is_err());
        assert!(MemoryChannel::failing().start().is_err());
    }
}
