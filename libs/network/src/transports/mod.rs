//! Transport Layer
//!
//! One transport per wire protocol. Every transport owns one bound socket,
//! declares the channel capabilities it cannot provide, and pushes verified
//! inbound payloads into the shared [`InboundPacket`] queue from the message
//! loop thread.
//!
//! Lifecycle is strictly `initialize -> start -> close`.

use crate::mesgloop::MessageLoop;
use crate::{Result, TransportError};
use bytes::Bytes;
use rand::Rng;
use runtime_config::RuntimeConfig;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;
use types::ChannelCaps;

pub mod frame;
pub mod manager;
pub mod metrics;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests;

// Re-export transport types
pub use frame::FrameBuffer;
pub use manager::TransportManager;
pub use metrics::{MetricsSnapshot, MetricsTracker};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Sending half of the inbound queue shared by all transports.
pub type InboundSender = crossbeam_channel::Sender<InboundPacket>;

/// Receiving half of the inbound queue.
pub type InboundReceiver = crossbeam_channel::Receiver<InboundPacket>;

/// Transport interface shared by UDP and TCP.
///
/// Methods take `&self`; implementations keep their mutable state behind
/// locks so one transport can be shared between the router thread and any
/// process thread that sends.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Capabilities this transport cannot provide.
    fn unsupported(&self) -> ChannelCaps;

    fn state(&self) -> TransportState;

    /// Bound local port, once initialized.
    fn address(&self) -> Option<u16>;

    /// Bind the socket.
    fn initialize(&self, options: &TransportOptions) -> Result<()>;

    /// Register with `mesgloop` and begin delivering into `inbound`.
    fn start(&self, inbound: InboundSender, mesgloop: &MessageLoop) -> Result<()>;

    /// Deregister, close the socket and drop cached peer connections.
    fn close(&self);

    /// Send one payload to `target`.
    fn send(&self, payload: &[u8], target: SocketAddr, options: &SendOptions) -> Result<()>;

    fn metrics(&self) -> MetricsSnapshot;
}

/// Transport kinds, in slot order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp = 0,
    Tcp = 1,
}

impl TransportKind {
    pub const ALL: [TransportKind; 2] = [TransportKind::Udp, TransportKind::Tcp];

    /// Index of this kind's slot in the transport manager and in process ids.
    pub fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Udp => "UdpTransport",
            TransportKind::Tcp => "TcpTransport",
        })
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Initialized,
    Started,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportState::Uninitialized => "uninitialized",
            TransportState::Initialized => "initialized",
            TransportState::Started => "started",
            TransportState::Closed => "closed",
        })
    }
}

/// One decoded inbound payload
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub kind: TransportKind,
    pub payload: Bytes,
    pub remote: SocketAddr,
}

/// Options consumed by `initialize` and the send paths.
#[derive(Clone)]
pub struct TransportOptions {
    pub hostname: String,
    pub port: Option<u16>,
    pub strict: bool,
    pub linear: bool,
    pub bind_retries: u32,
    pub min_port: u16,
    pub max_port: u16,
    pub buffer_size: usize,
    pub authkey: Option<Vec<u8>>,
    pub send_retries: u32,
    pub udp_retry_wait: Duration,
    pub tcp_retry_wait: Duration,
    pub tcp_connect_timeout: Duration,
    pub max_frame_size: usize,
}

impl From<&RuntimeConfig> for TransportOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            port: config.port,
            strict: config.strict,
            linear: config.linear,
            bind_retries: config.bind_retries,
            min_port: config.min_port,
            max_port: config.max_port,
            buffer_size: config.message_buffer_size,
            authkey: config.authkey_bytes().map(<[u8]>::to_vec),
            send_retries: config.send_retries,
            udp_retry_wait: config.udp_retry_wait(),
            tcp_retry_wait: config.tcp_retry_wait(),
            tcp_connect_timeout: config.tcp_connect_timeout(),
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("strict", &self.strict)
            .field("linear", &self.linear)
            .field("ports", &(self.min_port..=self.max_port))
            .field("authenticated", &self.authkey.is_some())
            .finish_non_exhaustive()
    }
}

/// Per-send options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Retry connection-refused failures instead of failing at once
    pub retry_refused: bool,
}

/// Resolve `hostname:port`, preferring IPv4.
pub fn resolve(hostname: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (hostname, port)
        .to_socket_addrs()
        .map_err(|e| {
            TransportError::network_with_source(format!("cannot resolve {hostname}"), e)
        })?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| TransportError::network(format!("no address for {hostname}")))
}

/// Bind with the configured port policy.
///
/// The first port is `options.port`, or a random one from the range. On a
/// conflict the next port is the following one (linear) or another random
/// one, until `bind_retries` attempts are used up. Strict binding makes a
/// single attempt on the configured port.
pub(crate) fn bind_with_retry<T>(
    kind: TransportKind,
    options: &TransportOptions,
    mut bind: impl FnMut(SocketAddr) -> io::Result<T>,
) -> Result<(T, u16)> {
    if options.min_port > options.max_port {
        return Err(TransportError::configuration(
            "empty port range",
            Some("min_port"),
        ));
    }
    let random_port = || rand::thread_rng().gen_range(options.min_port..=options.max_port);

    let mut port = match (options.port, options.strict) {
        (Some(port), _) => port,
        (None, false) => random_port(),
        (None, true) => {
            return Err(TransportError::binding(
                "port number not specified for strict binding",
                0,
                None,
            ))
        }
    };
    let attempts = if options.strict {
        1
    } else {
        options.bind_retries.max(1)
    };

    let mut last_error = None;
    for attempt in 1..=attempts {
        let addr = resolve(&options.hostname, port)?;
        match bind(addr) {
            Ok(socket) => {
                debug!(%kind, %addr, attempt, "transport bound");
                return Ok((socket, port));
            }
            Err(e) => {
                debug!(%kind, %addr, attempt, error = %e, "bind failed");
                last_error = Some(e);
                port = if options.linear {
                    if port >= options.max_port {
                        options.min_port
                    } else {
                        port + 1
                    }
                } else {
                    random_port()
                };
            }
        }
    }

    Err(TransportError::binding(
        format!("{kind} failed to bind an available port"),
        attempts,
        last_error,
    ))
}
