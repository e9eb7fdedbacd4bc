//! UDP Network Transport Implementation
//!
//! Every datagram is self-contained:
//!
//! ```text
//! [4-byte version][16-byte HMAC-MD5 digest or '0' filler][payload]
//! ```
//!
//! Received packets with a wrong version or digest are logged and dropped;
//! they never reach the inbound queue. Sends retry when the kernel throttles
//! outbound datagrams (`EPERM` from connection tracking, or a full send
//! buffer on the non-blocking socket).

use super::{
    bind_with_retry, InboundPacket, InboundSender, MetricsSnapshot, MetricsTracker, SendOptions,
    Transport, TransportKind, TransportOptions, TransportState,
};
use crate::mesgloop::{Flow, LoopHandler, LoopKey, MessageLoop};
use crate::protocol::Authenticator;
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};
use types::{ChannelCaps, PROTOCOL_VERSION, UDP_DATA_OFFSET, UNAUTHENTICATED_DIGEST, VERSION_BYTES};

/// Build a datagram for `payload`.
pub fn frame_packet(payload: &[u8], auth: Option<&Authenticator>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(UDP_DATA_OFFSET + payload.len());
    packet.extend_from_slice(&PROTOCOL_VERSION);
    match auth {
        Some(auth) => packet.extend_from_slice(&auth.digest(payload)),
        None => packet.extend_from_slice(&UNAUTHENTICATED_DIGEST),
    }
    packet.extend_from_slice(payload);
    packet
}

/// Check version and digest of a received datagram and return its payload.
pub fn verify_packet<'a>(
    packet: &'a [u8],
    auth: Option<&Authenticator>,
    remote: Option<SocketAddr>,
) -> Result<&'a [u8]> {
    if packet.len() < UDP_DATA_OFFSET {
        return Err(TransportError::protocol(format!(
            "truncated packet of {} bytes",
            packet.len()
        )));
    }
    let version = &packet[..VERSION_BYTES];
    if version != PROTOCOL_VERSION {
        return Err(TransportError::version_mismatch(&PROTOCOL_VERSION, version));
    }
    let digest = &packet[VERSION_BYTES..UDP_DATA_OFFSET];
    let payload = &packet[UDP_DATA_OFFSET..];
    match auth {
        Some(auth) if !auth.verify(payload, digest) => Err(TransportError::authentication(
            format!("wrong digest {}", hex_prefix(digest)),
            remote,
        )),
        None if digest != UNAUTHENTICATED_DIGEST => {
            Err(TransportError::authentication("requires a cookie", remote))
        }
        _ => Ok(payload),
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

struct UdpCore {
    state: TransportState,
    /// Sending handle; the receive side owns a clone registered with the loop.
    socket: Option<Arc<StdUdpSocket>>,
    port: Option<u16>,
    options: TransportOptions,
    auth: Option<Authenticator>,
    registration: Option<(MessageLoop, LoopKey)>,
}

/// Datagram transport. Supports inter-host channels only: no ordering, no
/// reliability.
pub struct UdpTransport {
    core: Mutex<UdpCore>,
    metrics: MetricsTracker,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(UdpCore {
                state: TransportState::Uninitialized,
                socket: None,
                port: None,
                options: TransportOptions::default(),
                auth: None,
                registration: None,
            }),
            metrics: MetricsTracker::new(),
        }
    }

    /// Bound local socket address, once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core
            .lock()
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn unsupported(&self) -> ChannelCaps {
        ChannelCaps::all() - ChannelCaps::INTERHOST
    }

    fn state(&self) -> TransportState {
        self.core.lock().state
    }

    fn address(&self) -> Option<u16> {
        self.core.lock().port
    }

    fn initialize(&self, options: &TransportOptions) -> Result<()> {
        let mut core = self.core.lock();
        if core.state != TransportState::Uninitialized {
            return Err(TransportError::invalid_state("initialize", core.state));
        }
        let auth = options
            .authkey
            .as_deref()
            .map(Authenticator::new)
            .transpose()?;
        let (socket, _) =
            bind_with_retry(TransportKind::Udp, options, |addr| StdUdpSocket::bind(addr))?;
        let port = socket.local_addr()?.port();

        core.socket = Some(Arc::new(socket));
        core.port = Some(port);
        core.auth = auth;
        core.options = options.clone();
        core.state = TransportState::Initialized;
        debug!(port, "UdpTransport initialized");
        Ok(())
    }

    fn start(&self, inbound: InboundSender, mesgloop: &MessageLoop) -> Result<()> {
        let mut core = self.core.lock();
        if core.state != TransportState::Initialized {
            return Err(TransportError::invalid_state("start", core.state));
        }
        let socket = core
            .socket
            .as_ref()
            .ok_or_else(|| TransportError::invalid_state("start", "unbound"))?;

        let recv = socket.try_clone()?;
        recv.set_nonblocking(true)?;
        let handle = mesgloop.handle()?;
        let recv = {
            let _guard = handle.enter();
            tokio::net::UdpSocket::from_std(recv)?
        };
        let local = recv.local_addr()?;
        let key = LoopKey::udp(local);

        mesgloop.register(
            key,
            UdpReceiver {
                socket: recv,
                buf: vec![0; core.options.buffer_size + UDP_DATA_OFFSET + 1],
                auth: core.auth.clone(),
                inbound,
                metrics: self.metrics.clone(),
                local,
            },
        )?;
        core.registration = Some((mesgloop.clone(), key));
        core.state = TransportState::Started;
        debug!(%local, "UdpTransport started");
        Ok(())
    }

    fn close(&self) {
        let mut core = self.core.lock();
        if core.state == TransportState::Closed {
            debug!("UdpTransport already stopped");
            return;
        }
        if let Some((mesgloop, key)) = core.registration.take() {
            mesgloop.deregister(&key);
        }
        core.socket = None;
        core.state = TransportState::Closed;
        debug!(port = ?core.port, "UdpTransport stopped");
    }

    fn send(&self, payload: &[u8], target: SocketAddr, _options: &SendOptions) -> Result<()> {
        let (socket, auth, limit, retries, wait) = {
            let core = self.core.lock();
            match (&core.state, &core.socket) {
                (TransportState::Initialized | TransportState::Started, Some(socket)) => (
                    socket.clone(),
                    core.auth.clone(),
                    core.options.buffer_size,
                    core.options.send_retries.max(1),
                    core.options.udp_retry_wait,
                ),
                _ => return Err(TransportError::invalid_state("send", core.state)),
            }
        };

        if payload.len() > limit {
            warn!(
                size = payload.len(),
                limit, "Data size exceeded maximum buffer size! Outgoing packet dropped."
            );
            self.metrics.record_error("packet_size");
            return Err(TransportError::PacketSizeExceeded {
                size: payload.len(),
                limit,
            });
        }

        let packet = frame_packet(payload, auth.as_ref());
        let mut attempt = 0;
        loop {
            match socket.send_to(&packet, target) {
                Ok(sent) if sent == packet.len() => {
                    self.metrics.record_send(payload.len());
                    return Ok(());
                }
                Ok(sent) => {
                    self.metrics.record_error("network");
                    return Err(TransportError::network(format!(
                        "unable to send full packet ({sent}/{} bytes)",
                        packet.len()
                    )));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock
                    ) =>
                {
                    attempt += 1;
                    debug!(%target, attempt, "Packet dropped by kernel, reduce send rate.");
                    if attempt >= retries {
                        self.metrics.record_error("retries_exhausted");
                        return Err(TransportError::RetriesExhausted {
                            operation: format!("udp send to {target}"),
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    self.metrics.record_retry();
                    thread::sleep(wait);
                }
                Err(e) => {
                    self.metrics.record_error("io");
                    return Err(e.into());
                }
            }
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Loop callback for the bound socket
struct UdpReceiver {
    socket: tokio::net::UdpSocket,
    buf: Vec<u8>,
    auth: Option<Authenticator>,
    inbound: InboundSender,
    metrics: MetricsTracker,
    local: SocketAddr,
}

#[async_trait]
impl LoopHandler for UdpReceiver {
    async fn readable(&mut self) -> io::Result<()> {
        self.socket.readable().await
    }

    fn on_readable(&mut self) -> Flow {
        loop {
            let (len, remote) = match self.socket.try_recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    debug!(local = %self.local, error = %e, "Terminating receive loop");
                    return Flow::Close;
                }
            };

            if len == self.buf.len() {
                debug!(%remote, "Dropped truncated packet");
                self.metrics.record_drop();
                continue;
            }
            if len < UDP_DATA_OFFSET {
                debug!(%remote, len, "Dropped short packet");
                self.metrics.record_drop();
                continue;
            }

            match verify_packet(&self.buf[..len], self.auth.as_ref(), Some(remote)) {
                Ok(payload) => {
                    self.metrics.record_receive(payload.len());
                    let packet = InboundPacket {
                        kind: TransportKind::Udp,
                        payload: Bytes::copy_from_slice(payload),
                        remote,
                    };
                    if self.inbound.send(packet).is_err() {
                        debug!(local = %self.local, "Inbound queue closed");
                        return Flow::Close;
                    }
                }
                Err(e) => {
                    warn!(local = %self.local, %remote, error = %e, "Packet dropped");
                    self.metrics.record_auth_failure();
                }
            }
        }
    }
}
