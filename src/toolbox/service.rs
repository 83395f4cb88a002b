//! Toolbox RPC loop.
//!
//! The host polls the guest: every tick the service reads one request from
//! the inbound channel, dispatches it by command name and writes the reply
//! back on the same channel. Replies are `OK <body>`, `ERR <body>` or
//! `Unknown Command`. Idle polls back off exponentially up to the poll
//! interval; a request resets the delay so bursts are served immediately.

use std::collections::HashMap;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::toolbox::channel::{Channel, ChannelOut};

/// First idle delay; doubles on every empty poll.
pub const MIN_DELAY: Duration = Duration::from_millis(10);

/// `tools.set.version` value for 10.0.5 (major << 10 | minor << 5 | patch).
pub const TOOLS_VERSION_NUMBER: u32 = 10 << 10 | 5;

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Application name announced in the `reset` handshake and the HGFS
    /// capability.
    pub name: String,
    /// Upper bound of the idle poll delay.
    pub poll_interval: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "toolbox".into(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

type Handler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync>;
type PrimaryIpFn = Arc<dyn Fn() -> Option<String> + Send + Sync>;

pub struct Service {
    input: Box<dyn Channel>,
    out: ChannelOut,
    settings: ServiceSettings,
    handlers: HashMap<String, Handler>,
    delay: Duration,
}

/// Address of the interface that routes outbound traffic. Connecting a UDP
/// socket sends nothing; it only selects the source address.
pub fn default_primary_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => Some(ip.to_string()),
        _ => None,
    }
}

impl Service {
    pub fn new(input: Box<dyn Channel>, out: Box<dyn Channel>, settings: ServiceSettings) -> Self {
        let mut service = Self {
            input,
            out: ChannelOut::new(out),
            settings,
            handlers: HashMap::new(),
            delay: Duration::ZERO,
        };

        let name = service.settings.name.clone();
        service.register_command("reset", move |_| Ok(format!("ATR {name}").into_bytes()));
        service.register_command("ping", |_| Ok(Vec::new()));

        let out = service.out.clone();
        let capabilities = service.capabilities();
        service.register_command("Capabilities_Register", move |_| {
            for capability in &capabilities {
                if let Err(err) = out.request(capability.as_bytes()) {
                    warn!(%capability, error = %err, "capability registration failed");
                }
            }
            Ok(Vec::new())
        });

        service.with_primary_ip(default_primary_ip)
    }

    /// Replace how `Set_Option broadcastIP 1` finds the address to publish.
    pub fn with_primary_ip(mut self, f: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        let primary_ip: PrimaryIpFn = Arc::new(f);
        let out = self.out.clone();
        self.register_command("Set_Option", move |args| set_option(&out, &primary_ip, args));
        self
    }

    /// Register (or replace) the handler for `name`.
    pub fn register_command(
        &mut self,
        name: &str,
        handler: impl Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.handlers.insert(name.to_owned(), Box::new(handler));
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn out(&self) -> &ChannelOut {
        &self.out
    }

    /// Messages pushed on `Capabilities_Register`.
    pub fn capabilities(&self) -> Vec<String> {
        vec![
            format!("tools.set.version {TOOLS_VERSION_NUMBER}"),
            "tools.capability.statechange".to_owned(),
            format!("tools.capability.hgfs_server {} 1", self.settings.name),
        ]
    }

    /// Current idle delay before the next poll.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn backoff(&mut self) {
        let next = if self.delay.is_zero() {
            MIN_DELAY
        } else {
            self.delay.saturating_mul(2)
        };
        self.delay = next.min(self.settings.poll_interval);
    }

    /// Route one request to its handler and frame the reply.
    pub fn dispatch(&self, request: &[u8]) -> Vec<u8> {
        let (name, args) = match request.iter().position(|b| *b == b' ') {
            Some(ix) => (&request[..ix], &request[ix + 1..]),
            None => (request, &[][..]),
        };
        let end = name.iter().rposition(|b| *b != 0).map_or(0, |ix| ix + 1);
        let name = String::from_utf8_lossy(&name[..end]);

        let Some(handler) = self.handlers.get(name.as_ref()) else {
            debug!(%name, "unknown toolbox command");
            return b"Unknown Command".to_vec();
        };
        match handler(args) {
            Ok(body) => [b"OK ".as_slice(), &body].concat(),
            Err(err) => {
                warn!(%name, error = %err, "toolbox command failed");
                b"ERR ".to_vec()
            }
        }
    }

    fn poll(&mut self) {
        match self.input.receive() {
            Ok(Some(request)) if !request.is_empty() => {
                let reply = self.dispatch(&request);
                if let Err(err) = self.input.send(&reply) {
                    warn!(error = %err, "toolbox reply failed");
                }
                self.delay = Duration::ZERO;
            }
            Ok(_) => self.backoff(),
            Err(err) => {
                warn!(error = %err, "toolbox receive failed, restarting channel");
                if let Err(err) = self.input.stop().and_then(|()| self.input.start()) {
                    warn!(error = %err, "toolbox channel restart failed");
                }
                self.backoff();
            }
        }
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.input.stop() {
            warn!(error = %err, "stopping toolbox in channel");
        }
        if let Err(err) = self.out.stop() {
            warn!(error = %err, "stopping toolbox out channel");
        }
    }

    /// Open both channels and run the poll loop on the current runtime.
    pub fn start(mut self) -> Result<RunningService> {
        self.input.start()?;
        if let Err(err) = self.out.start() {
            self.shutdown();
            return Err(err);
        }
        info!(name = %self.settings.name, interval = ?self.settings.poll_interval, "toolbox service started");

        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    () = tokio::time::sleep(self.delay) => self.poll(),
                }
            }
            self.shutdown();
            info!(name = %self.settings.name, "toolbox service stopped");
        });
        Ok(RunningService { stop, task })
    }
}

fn set_option(out: &ChannelOut, primary_ip: &PrimaryIpFn, args: &[u8]) -> Result<Vec<u8>> {
    let args = String::from_utf8_lossy(args);
    let mut parts = args.trim_end_matches('\0').splitn(2, ' ');
    let key = parts.next().unwrap_or_default();
    let value = parts.next().unwrap_or_default();

    if key == "broadcastIP" && value == "1" {
        let ip = primary_ip().ok_or_else(|| Error::NotFound("primary ip".into()))?;
        out.request(format!("info-set guestinfo.ip {ip}").as_bytes())?;
        debug!(%ip, "broadcast guest ip");
    }
    Ok(Vec::new())
}

/// Handle on a started [`Service`]. Dropping it also stops the loop.
pub struct RunningService {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RunningService {
    /// Stop polling, close both channels and wait for the loop to exit.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "toolbox service task failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolbox::channel::MemoryChannel;

    fn service(out: &MemoryChannel) -> Service {
        let service = Service::new(
            Box::new(MemoryChannel::new()),
            Box::new(out.clone()),
            ServiceSettings::default(),
        );
        service.out().start().unwrap();
        service
    }

    fn ok_out() -> MemoryChannel {
        MemoryChannel::with_responder(|_| b"1 ".to_vec())
    }

    #[test]
    fn builtin_commands() {
        let out = ok_out();
        let s = service(&out);

        assert_eq!(s.dispatch(b"reset"), b"OK ATR toolbox");
        assert_eq!(s.dispatch(b"ping\0"), b"OK ");
        assert_eq!(s.dispatch(b"Set_Option synctime 1"), b"OK ");
        assert_eq!(s.dispatch(b"NOPE"), b"Unknown Command");

        assert_eq!(s.dispatch(b"Capabilities_Register"), b"OK ");
        let sent: Vec<String> = out.sent().iter().map(|m| String::from_utf8_lossy(m).into_owned()).collect();
        assert_eq!(sent, s.capabilities());
        assert!(sent.contains(&"tools.capability.hgfs_server toolbox 1".to_owned()));
    }

    #[test]
    fn capability_failures_still_reply_ok() {
        let out = MemoryChannel::with_responder(|_| b"0 no".to_vec());
        let s = service(&out);
        assert_eq!(s.dispatch(b"Capabilities_Register"), b"OK ");
    }

    #[test]
    fn broadcast_ip() {
        let out = ok_out();
        let s = service(&out).with_primary_ip(|| Some("10.0.0.1".into()));
        assert_eq!(s.dispatch(b"Set_Option broadcastIP 1"), b"OK ");
        assert_eq!(out.sent(), vec![b"info-set guestinfo.ip 10.0.0.1".to_vec()]);

        let s = service(&ok_out()).with_primary_ip(|| None);
        assert_eq!(s.dispatch(b"Set_Option broadcastIP 1"), b"ERR ");

        let rejecting = MemoryChannel::with_responder(|_| b"0 denied".to_vec());
        let s = service(&rejecting).with_primary_ip(|| Some("10.0.0.1".into()));
        assert_eq!(s.dispatch(b"Set_Option broadcastIP 1"), b"ERR ");
    }

    #[test]
    fn handler_errors_reply_err() {
        let mut s = service(&ok_out());
        s.register_command("boom", |_| Err(Error::InvalidArgument("boom".into())));
        s.register_command("echo", |args| Ok(args.to_vec()));
        assert_eq!(s.dispatch(b"boom"), b"ERR ");
        assert_eq!(s.dispatch(b"echo a b"), b"OK a b");
    }

    #[test]
    fn backoff_doubles_up_to_the_poll_interval() {
        let mut s = Service::new(
            Box::new(MemoryChannel::new()),
            Box::new(MemoryChannel::new()),
            ServiceSettings {
                poll_interval: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let mut delays = Vec::new();
        for _ in 0..6 {
            s.backoff();
            delays.push(s.delay().as_millis());
        }
        assert_eq!(delays, [10, 20, 40, 80, 100, 100]);
    }

    #[tokio::test]
    async fn loop_replies_on_the_in_channel() {
        let input = MemoryChannel::new();
        let s = Service::new(
            Box::new(input.clone()),
            Box::new(ok_out()),
            ServiceSettings {
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        input.push(b"ping".to_vec());
        input.push(b"reset".to_vec());
        let running = s.start().unwrap();

        for _ in 0..200 {
            if input.sent().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(input.sent(), vec![b"OK ".to_vec(), b"OK ATR toolbox".to_vec()]);

        running.stop().await;
        assert!(!input.is_started());
    }

    #[tokio::test]
    async fn start_fails_when_a_channel_cannot_open() {
        let s = Service::new(
            Box::new(MemoryChannel::new()),
            Box::new(MemoryChannel::failing()),
            ServiceSettings::default(),
        );
        assert!(s.start().is_err());
    }
}
