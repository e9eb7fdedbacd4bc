//! TCP Network Transport Implementation
//!
//! Reliable, ordered, inter-host channels over cached stream connections.
//!
//! ## Handshake
//!
//! The accepting side speaks first:
//!
//! ```text
//! acceptor  -> "#KY#" + version + 20-byte nonce     (key configured)
//!           -> "#VR#" + version                     (no key)
//! connector -> [4-byte listen port][HMAC(nonce)]    or [port]["#VR#"]
//! acceptor  -> "#WELCOME#" | "#FAILURE#"
//! ```
//!
//! A connector without a key answers a keyed challenge with `#KY#` and
//! gives up; so does a keyed connector facing a version-only challenge.
//! The acceptor caches an accepted connection under the connector's
//! `(ip, listen port)`, so replies to that peer reuse the same stream.
//!
//! ## Framing
//!
//! After the handshake every message is an 8-byte big-endian length followed
//! by the payload; see [`FrameBuffer`].

use super::frame::{frame_header, FrameBuffer, HEADER_SIZE};
use super::{
    bind_with_retry, InboundPacket, InboundSender, MetricsSnapshot, MetricsTracker, SendOptions,
    Transport, TransportKind, TransportOptions, TransportState,
};
use crate::mesgloop::{Flow, LoopHandler, LoopKey, MessageLoop};
use crate::protocol::{generate_nonce, Authenticator};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};
use types::{
    ChannelCaps, DIGEST_LENGTH, FAILURE, KEY_CHALLENGE, NONCE_LENGTH, PROTOCOL_VERSION,
    VER_CHALLENGE, WELCOME,
};

/// Listen port announced by the connector, big-endian
const ADDRESS_SIZE: usize = 4;

/// Tag length of a challenge or tag reply
const TAG_SIZE: usize = 4;

/// A live connection shared by the send path and its loop handler
#[derive(Clone)]
struct CachedConn {
    id: u64,
    stream: Arc<TcpStream>,
    /// Serializes whole frames from concurrent senders
    write_lock: Arc<AsyncMutex<()>>,
    key: LoopKey,
}

/// State shared by the loop callbacks and the send path once started
struct Shared {
    auth: Option<Authenticator>,
    inbound: InboundSender,
    mesgloop: MessageLoop,
    cache: Mutex<HashMap<SocketAddr, CachedConn>>,
    metrics: MetricsTracker,
    port_bytes: [u8; ADDRESS_SIZE],
    buffer_size: usize,
    max_frame_size: usize,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop `remote` from the cache if it still maps to connection `id`.
    fn evict(&self, remote: SocketAddr, id: u64) {
        let removed = {
            let mut cache = self.cache.lock();
            match cache.get(&remote) {
                Some(conn) if conn.id == id => cache.remove(&remote),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            self.mesgloop.deregister(&conn.key);
            debug!(%remote, "Cleanup connection");
        }
    }

    /// Push one payload to the inbound queue; false once the queue is gone.
    fn deliver(&self, payload: Bytes, remote: SocketAddr) -> bool {
        self.metrics.record_receive(payload.len());
        let packet = InboundPacket {
            kind: TransportKind::Tcp,
            payload,
            remote,
        };
        self.inbound.send(packet).is_ok()
    }
}

struct TcpCore {
    state: TransportState,
    listener: Option<StdTcpListener>,
    port: Option<u16>,
    options: TransportOptions,
    auth: Option<Authenticator>,
    shared: Option<Arc<Shared>>,
    listener_key: Option<LoopKey>,
}

/// Stream transport. Supports FIFO, reliable and inter-host channels.
pub struct TcpTransport {
    core: Mutex<TcpCore>,
    metrics: MetricsTracker,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            core: Mutex::new(TcpCore {
                state: TransportState::Uninitialized,
                listener: None,
                port: None,
                options: TransportOptions::default(),
                auth: None,
                shared: None,
                listener_key: None,
            }),
            metrics: MetricsTracker::new(),
        }
    }

    /// Number of cached peer connections, accepted or initiated.
    pub fn connection_count(&self) -> usize {
        self.core
            .lock()
            .shared
            .as_ref()
            .map_or(0, |shared| shared.cache.lock().len())
    }

    /// True when a connection to `remote` is cached.
    pub fn is_connected(&self, remote: SocketAddr) -> bool {
        self.core
            .lock()
            .shared
            .as_ref()
            .is_some_and(|shared| shared.cache.lock().contains_key(&remote))
    }

    /// Open, authenticate and cache a connection to `target`.
    fn connect(shared: &Arc<Shared>, target: SocketAddr, timeout: Duration) -> Result<CachedConn> {
        debug!(%target, "Initiating connection");
        let handshake = {
            let shared = shared.clone();
            async move {
                tokio::time::timeout(
                    timeout,
                    answer_challenge(target, shared.auth.as_ref(), shared.port_bytes),
                )
                .await
            }
        };
        let stream = shared
            .mesgloop
            .block_on(handshake)?
            .map_err(|_| {
                TransportError::timeout(format!("connect to {target}"), timeout.as_millis() as u64)
            })??;

        let local = stream.local_addr()?;
        let stream = Arc::new(stream);
        let conn = CachedConn {
            id: shared.next_id(),
            stream: stream.clone(),
            write_lock: Arc::new(AsyncMutex::new(())),
            key: LoopKey::tcp_connection(local, target),
        };
        let replaced = shared.cache.lock().insert(target, conn.clone());
        if let Some(old) = replaced {
            shared.mesgloop.deregister(&old.key);
        }
        shared.mesgloop.register(
            conn.key,
            Connection {
                stream,
                peer: target,
                remote: target,
                id: conn.id,
                key: conn.key,
                shared: shared.clone(),
                phase: Phase::Established(FrameBuffer::new(
                    shared.buffer_size,
                    shared.max_frame_size,
                )),
                outgoing: None,
                cached: true,
            },
        )?;
        debug!(%target, %local, "Connection established");
        Ok(conn)
    }

    fn write_frame(
        shared: &Shared,
        conn: &CachedConn,
        frame: &Bytes,
        target: SocketAddr,
        timeout: Duration,
    ) -> Result<()> {
        let conn = conn.clone();
        let frame = frame.clone();
        shared
            .mesgloop
            .block_on(async move {
                let _guard = conn.write_lock.lock().await;
                tokio::time::timeout(timeout, write_all(&conn.stream, &frame)).await
            })?
            .map_err(|_| {
                TransportError::timeout(format!("write to {target}"), timeout.as_millis() as u64)
            })?
            .map_err(TransportError::from)
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn unsupported(&self) -> ChannelCaps {
        ChannelCaps::all() - (ChannelCaps::FIFO | ChannelCaps::RELIABLE | ChannelCaps::INTERHOST)
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
        let (listener, _) =
            bind_with_retry(TransportKind::Tcp, options, |addr| StdTcpListener::bind(addr))?;
        let port = listener.local_addr()?.port();

        core.listener = Some(listener);
        core.port = Some(port);
        core.auth = auth;
        core.options = options.clone();
        core.state = TransportState::Initialized;
        debug!(port, "TcpTransport initialized");
        Ok(())
    }

    fn start(&self, inbound: InboundSender, mesgloop: &MessageLoop) -> Result<()> {
        let mut core = self.core.lock();
        if core.state != TransportState::Initialized {
            return Err(TransportError::invalid_state("start", core.state));
        }
        let (Some(listener), Some(port)) = (core.listener.take(), core.port) else {
            return Err(TransportError::invalid_state("start", "unbound"));
        };

        listener.set_nonblocking(true)?;
        let handle = mesgloop.handle()?;
        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(listener)?
        };
        let local = listener.local_addr()?;
        let key = LoopKey::tcp_listener(local);

        let shared = Arc::new(Shared {
            auth: core.auth.clone(),
            inbound,
            mesgloop: mesgloop.clone(),
            cache: Mutex::new(HashMap::new()),
            metrics: self.metrics.clone(),
            port_bytes: u32::from(port).to_be_bytes(),
            buffer_size: core.options.buffer_size,
            max_frame_size: core.options.max_frame_size,
            next_id: AtomicU64::new(1),
        });
        mesgloop.register(
            key,
            Acceptor {
                listener,
                local,
                shared: shared.clone(),
                accepted: None,
            },
        )?;

        core.shared = Some(shared);
        core.listener_key = Some(key);
        core.state = TransportState::Started;
        debug!(%local, "TcpTransport started");
        Ok(())
    }

    fn close(&self) {
        let mut core = self.core.lock();
        if core.state == TransportState::Closed {
            debug!("TcpTransport already stopped");
            return;
        }
        if let Some(shared) = core.shared.take() {
            let connections: Vec<CachedConn> =
                shared.cache.lock().drain().map(|(_, conn)| conn).collect();
            for conn in &connections {
                shared.mesgloop.deregister(&conn.key);
            }
            if let Some(key) = core.listener_key.take() {
                shared.mesgloop.deregister(&key);
            }
            debug!(connections = connections.len(), "Closed cached connections");
        }
        core.listener = None;
        core.state = TransportState::Closed;
        debug!(port = ?core.port, "TcpTransport stopped");
    }

    fn send(&self, payload: &[u8], target: SocketAddr, options: &SendOptions) -> Result<()> {
        let (shared, retries, wait, timeout) = {
            let core = self.core.lock();
            match (&core.state, &core.shared) {
                (TransportState::Started, Some(shared)) => (
                    shared.clone(),
                    core.options.send_retries,
                    core.options.tcp_retry_wait,
                    core.options.tcp_connect_timeout,
                ),
                _ => return Err(TransportError::invalid_state("send", core.state)),
            }
        };

        if payload.len() > shared.max_frame_size {
            self.metrics.record_error("packet_size");
            return Err(TransportError::PacketSizeExceeded {
                size: payload.len(),
                limit: shared.max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&frame_header(payload.len()));
        frame.extend_from_slice(payload);
        let frame = Bytes::from(frame);

        let mut retry = 1;
        loop {
            let cached = shared.cache.lock().get(&target).cloned();
            let attempt = match cached {
                Some(conn) => Self::write_frame(&shared, &conn, &frame, target, timeout)
                    .map_err(|e| (Some(conn.id), e)),
                None => match Self::connect(&shared, target, timeout) {
                    Ok(conn) => Self::write_frame(&shared, &conn, &frame, target, timeout)
                        .map_err(|e| (Some(conn.id), e)),
                    Err(e) => Err((None, e)),
                },
            };

            let (conn_id, err) = match attempt {
                Ok(()) => {
                    self.metrics.record_send(payload.len());
                    trace!(%target, bytes = frame.len(), "Frame sent");
                    return Ok(());
                }
                Err(failure) => failure,
            };
            if let Some(id) = conn_id {
                shared.evict(target, id);
            }

            let refused = err.is_refused();
            if (refused && !options.retry_refused) || (!refused && !err.is_transient()) {
                self.metrics.record_error(err.category());
                return Err(err);
            }
            if retry > retries {
                warn!(%target, attempts = retry, error = %err, "Giving up on peer");
                self.metrics.record_error("retries_exhausted");
                return Err(TransportError::RetriesExhausted {
                    operation: format!("tcp send to {target}"),
                    attempts: retry,
                    last_error: err.to_string(),
                });
            }
            debug!(%target, retry, error = %err, "Sending failed, retrying");
            if retry > 1 {
                thread::sleep(wait);
            }
            retry += 1;
            self.metrics.record_retry();
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Connector half of the handshake. Returns the authenticated stream.
async fn answer_challenge(
    target: SocketAddr,
    auth: Option<&Authenticator>,
    port_bytes: [u8; ADDRESS_SIZE],
) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(|e| TransportError::connection_with_source("connect failed", Some(target), e))?;
    stream.set_nodelay(true)?;

    let mut head = [0u8; TAG_SIZE + PROTOCOL_VERSION.len()];
    read_exact(&mut stream, &mut head, target).await?;
    let (tag, version) = head.split_at(TAG_SIZE);

    let mut reply = port_bytes.to_vec();
    let outcome = match auth {
        Some(auth) if tag == KEY_CHALLENGE => {
            if version != PROTOCOL_VERSION {
                return Err(TransportError::version_mismatch(&PROTOCOL_VERSION, version));
            }
            let mut nonce = [0u8; NONCE_LENGTH];
            read_exact(&mut stream, &mut nonce, target).await?;
            reply.extend_from_slice(&auth.digest(&nonce));
            Ok(())
        }
        Some(_) => {
            reply.extend_from_slice(KEY_CHALLENGE);
            Err(TransportError::authentication(
                format!("{target} has no cookie"),
                Some(target),
            ))
        }
        None if tag == KEY_CHALLENGE => {
            reply.extend_from_slice(KEY_CHALLENGE);
            Err(TransportError::authentication(
                format!("{target} requires a cookie"),
                Some(target),
            ))
        }
        None if tag == VER_CHALLENGE && version == PROTOCOL_VERSION => {
            reply.extend_from_slice(VER_CHALLENGE);
            Ok(())
        }
        None => {
            reply.extend_from_slice(FAILURE);
            Err(TransportError::version_mismatch(&PROTOCOL_VERSION, version))
        }
    };
    // the peer learns why we hang up even when we do
    stream.write_all(&reply).await?;
    outcome?;

    let mut response = [0u8; WELCOME.len()];
    read_exact(&mut stream, &mut response, target).await?;
    if response != WELCOME {
        return Err(TransportError::authentication(
            format!("digest was rejected by {target}"),
            Some(target),
        ));
    }
    Ok(stream)
}

async fn read_exact(stream: &mut TcpStream, buf: &mut [u8], target: SocketAddr) -> Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::ConnectionClosed {
            remote_addr: Some(target),
        }),
        Err(e) => Err(e.into()),
    }
}

async fn write_all(stream: &TcpStream, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// What the acceptor expects back from its challenge
enum Expected {
    Digest([u8; NONCE_LENGTH]),
    Version,
}

impl Expected {
    fn reply_len(&self) -> usize {
        ADDRESS_SIZE
            + match self {
                Expected::Digest(_) => DIGEST_LENGTH,
                Expected::Version => TAG_SIZE,
            }
    }
}

/// Build the challenge for a new connection.
fn challenge(auth: Option<&Authenticator>) -> (Vec<u8>, Expected) {
    let mut message = Vec::with_capacity(TAG_SIZE + PROTOCOL_VERSION.len() + NONCE_LENGTH);
    match auth {
        Some(_) => {
            let nonce = generate_nonce();
            message.extend_from_slice(KEY_CHALLENGE);
            message.extend_from_slice(&PROTOCOL_VERSION);
            message.extend_from_slice(&nonce);
            (message, Expected::Digest(nonce))
        }
        None => {
            message.extend_from_slice(VER_CHALLENGE);
            message.extend_from_slice(&PROTOCOL_VERSION);
            (message, Expected::Version)
        }
    }
}

/// Judge a (possibly partial) reply to our challenge.
///
/// `None` means more bytes are needed. On success returns the connector's
/// listen port.
fn check_reply(
    expected: &Expected,
    auth: Option<&Authenticator>,
    reply: &[u8],
    peer: SocketAddr,
) -> Option<Result<u16>> {
    if reply.len() < ADDRESS_SIZE + TAG_SIZE {
        return None;
    }
    let (port, body) = reply.split_at(ADDRESS_SIZE);
    let port = u32::from_be_bytes([port[0], port[1], port[2], port[3]]);
    let tagged = [KEY_CHALLENGE.as_slice(), VER_CHALLENGE, &FAILURE[..TAG_SIZE]]
        .contains(&&body[..TAG_SIZE]);

    let verdict = match (expected, auth) {
        (Expected::Digest(_), _) if tagged => Err(TransportError::authentication(
            "peer has no cookie",
            Some(peer),
        )),
        (Expected::Digest(_), _) if body.len() < DIGEST_LENGTH => return None,
        (Expected::Digest(nonce), Some(auth)) => {
            if auth.verify(nonce, &body[..DIGEST_LENGTH]) {
                Ok(())
            } else {
                Err(TransportError::authentication(
                    "wrong digest in challenge reply",
                    Some(peer),
                ))
            }
        }
        (Expected::Digest(_), None) => Err(TransportError::invalid_state(
            "verify challenge",
            "without a key",
        )),
        (Expected::Version, _) if body[..TAG_SIZE] == *VER_CHALLENGE => Ok(()),
        (Expected::Version, _) if body[..TAG_SIZE] == *KEY_CHALLENGE => Err(
            TransportError::authentication("requires a cookie", Some(peer)),
        ),
        (Expected::Version, _) => Err(TransportError::version_mismatch(
            VER_CHALLENGE,
            &body[..TAG_SIZE],
        )),
    };

    Some(verdict.and_then(|()| {
        if reply.len() > expected.reply_len() {
            return Err(TransportError::protocol("data sent before handshake completed"));
        }
        u16::try_from(port)
            .map_err(|_| TransportError::protocol(format!("announced port {port} out of range")))
    }))
}

/// Loop callback for the listening socket
struct Acceptor {
    listener: TcpListener,
    local: SocketAddr,
    shared: Arc<Shared>,
    accepted: Option<(TcpStream, SocketAddr)>,
}

#[async_trait]
impl LoopHandler for Acceptor {
    async fn readable(&mut self) -> io::Result<()> {
        let accepted = self.listener.accept().await?;
        self.accepted = Some(accepted);
        Ok(())
    }

    fn on_readable(&mut self) -> Flow {
        let Some((stream, peer)) = self.accepted.take() else {
            return Flow::Continue;
        };
        debug!(local = %self.local, %peer, "Accepted connection");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }

        let (message, expected) = challenge(self.shared.auth.as_ref());
        let key = LoopKey::tcp_connection(self.local, peer);
        let connection = Connection {
            stream: Arc::new(stream),
            peer,
            remote: peer,
            id: self.shared.next_id(),
            key,
            shared: self.shared.clone(),
            phase: Phase::AwaitingReply {
                expected,
                buf: Vec::with_capacity(ADDRESS_SIZE + DIGEST_LENGTH),
            },
            outgoing: Some(Outgoing::Challenge(message)),
            cached: false,
        };
        if let Err(e) = self.shared.mesgloop.register(key, connection) {
            warn!(%peer, error = %e, "Could not register accepted connection");
        }
        Flow::Continue
    }
}

enum Phase {
    AwaitingReply { expected: Expected, buf: Vec<u8> },
    Established(FrameBuffer),
}

/// Handshake bytes the acceptor still owes its peer
enum Outgoing {
    Challenge(Vec<u8>),
    /// Holds the cached connection's write lock until the welcome is out
    Welcome(OwnedMutexGuard<()>),
    /// Close once written
    Failure,
}

/// Loop callback for one connection, from either side
struct Connection {
    stream: Arc<TcpStream>,
    /// Address the socket is connected to
    peer: SocketAddr,
    /// Cache key: the peer's listening address
    remote: SocketAddr,
    id: u64,
    key: LoopKey,
    shared: Arc<Shared>,
    phase: Phase,
    outgoing: Option<Outgoing>,
    cached: bool,
}

impl Connection {
    fn read_reply(&mut self) -> Flow {
        let Phase::AwaitingReply { expected, buf } = &mut self.phase else {
            return Flow::Continue;
        };
        let mut chunk = [0u8; 64];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!(peer = %self.peer, "Peer disconnected during handshake");
                    return Flow::Close;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Handshake read failed");
                    return Flow::Close;
                }
            }
        }

        let port = match check_reply(expected, self.shared.auth.as_ref(), buf, self.peer) {
            None => return Flow::Continue,
            Some(Ok(port)) => port,
            Some(Err(e)) => {
                warn!(peer = %self.peer, error = %e, "Connection rejected");
                self.shared.metrics.record_auth_failure();
                self.outgoing = Some(Outgoing::Failure);
                return Flow::Continue;
            }
        };

        let remote = SocketAddr::new(self.peer.ip(), port);
        let write_lock = Arc::new(AsyncMutex::new(()));
        // senders queue behind the welcome
        let Ok(welcome) = write_lock.clone().try_lock_owned() else {
            return Flow::Close;
        };
        {
            let mut cache = self.shared.cache.lock();
            if cache.contains_key(&remote) {
                debug!(%remote, "Dropping duplicate connection");
                return Flow::Close;
            }
            cache.insert(
                remote,
                CachedConn {
                    id: self.id,
                    stream: self.stream.clone(),
                    write_lock,
                    key: self.key,
                },
            );
        }

        debug!(%remote, peer = %self.peer, "Connection authenticated");
        self.outgoing = Some(Outgoing::Welcome(welcome));
        self.remote = remote;
        self.cached = true;
        self.phase = Phase::Established(FrameBuffer::new(
            self.shared.buffer_size,
            self.shared.max_frame_size,
        ));
        Flow::Continue
    }

    fn read_frames(&mut self) -> Flow {
        let Phase::Established(frames) = &mut self.phase else {
            return Flow::Continue;
        };
        loop {
            let window = frames.writable();
            match self.stream.try_read(window) {
                Ok(0) => {
                    debug!(remote = %self.remote, "Peer disconnected");
                    return Flow::Close;
                }
                Ok(n) => match frames.commit(n) {
                    Ok(complete) => {
                        for payload in complete {
                            if !self.shared.deliver(payload, self.remote) {
                                debug!(remote = %self.remote, "Inbound queue closed");
                                return Flow::Close;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(remote = %self.remote, error = %e, "Closing connection on bad frame");
                        self.shared.metrics.record_error(e.category());
                        return Flow::Close;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e) => {
                    debug!(remote = %self.remote, error = %e, "Socket error when receiving");
                    return Flow::Close;
                }
            }
        }
    }
}

#[async_trait]
impl LoopHandler for Connection {
    async fn readable(&mut self) -> io::Result<()> {
        match self.outgoing.take() {
            Some(Outgoing::Challenge(message)) => write_all(&self.stream, &message).await?,
            Some(Outgoing::Welcome(_guard)) => write_all(&self.stream, WELCOME).await?,
            Some(Outgoing::Failure) => {
                write_all(&self.stream, FAILURE).await?;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "handshake rejected",
                ));
            }
            None => {}
        }
        self.stream.readable().await
    }

    fn on_readable(&mut self) -> Flow {
        match self.phase {
            Phase::AwaitingReply { .. } => self.read_reply(),
            Phase::Established(_) => self.read_frames(),
        }
    }

    fn on_closed(&mut self) {
        if self.cached {
            self.shared.evict(self.remote, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn reply(port: u32, body: &[u8]) -> Vec<u8> {
        let mut reply = port.to_be_bytes().to_vec();
        reply.extend_from_slice(body);
        reply
    }

    #[test]
    fn test_keyless_challenge_layout() {
        let (message, expected) = challenge(None);
        assert_eq!(&message[..4], VER_CHALLENGE);
        assert_eq!(&message[4..], &PROTOCOL_VERSION);
        assert_eq!(expected.reply_len(), 8);
    }

    #[test]
    fn test_keyed_challenge_carries_nonce() {
        let auth = Authenticator::new(b"secret").unwrap();
        let (message, expected) = challenge(Some(&auth));
        assert_eq!(&message[..4], KEY_CHALLENGE);
        assert_eq!(message.len(), 4 + 4 + NONCE_LENGTH);
        match expected {
            Expected::Digest(nonce) => assert_eq!(&message[8..], &nonce),
            Expected::Version => panic!("expected a digest challenge"),
        }
    }

    #[test]
    fn test_version_reply_accepted() {
        let verdict = check_reply(&Expected::Version, None, &reply(12000, VER_CHALLENGE), peer());
        assert_eq!(verdict.unwrap().unwrap(), 12000);
    }

    #[test]
    fn test_partial_reply_waits() {
        let full = reply(12000, VER_CHALLENGE);
        assert!(check_reply(&Expected::Version, None, &full[..5], peer()).is_none());
    }

    #[test]
    fn test_keyless_acceptor_rejects_key_reply() {
        let verdict = check_reply(&Expected::Version, None, &reply(1, KEY_CHALLENGE), peer());
        assert!(matches!(
            verdict,
            Some(Err(TransportError::Authentication { .. }))
        ));
    }

    #[test]
    fn test_keyless_acceptor_rejects_failure_reply() {
        let verdict = check_reply(&Expected::Version, None, &reply(1, FAILURE), peer());
        assert!(matches!(verdict, Some(Err(_))));
    }

    #[test]
    fn test_digest_reply() {
        let auth = Authenticator::new(b"secret").unwrap();
        let nonce = generate_nonce();
        let expected = Expected::Digest(nonce);

        let good = reply(7000, &auth.digest(&nonce));
        let verdict = check_reply(&expected, Some(&auth), &good, peer());
        assert_eq!(verdict.unwrap().unwrap(), 7000);

        let other = Authenticator::new(b"other").unwrap();
        let bad = reply(7000, &other.digest(&nonce));
        assert!(matches!(
            check_reply(&expected, Some(&auth), &bad, peer()),
            Some(Err(TransportError::Authentication { .. }))
        ));
    }

    #[test]
    fn test_keyed_acceptor_rejects_tag_reply() {
        let auth = Authenticator::new(b"secret").unwrap();
        let expected = Expected::Digest(generate_nonce());
        let verdict = check_reply(&expected, Some(&auth), &reply(1, KEY_CHALLENGE), peer());
        assert!(matches!(
            verdict,
            Some(Err(TransportError::Authentication { .. }))
        ));
    }

    #[test]
    fn test_out_of_range_port() {
        let verdict = check_reply(&Expected::Version, None, &reply(70000, VER_CHALLENGE), peer());
        assert!(matches!(verdict, Some(Err(TransportError::Protocol { .. }))));
    }

    #[test]
    fn test_broadcast_unsupported() {
        let transport = TcpTransport::new();
        assert!(transport.unsupported().contains(ChannelCaps::BROADCAST));
        assert!(!transport.unsupported().intersects(ChannelCaps::RELIABLE_FIFO));
    }

    #[test]
    fn test_send_requires_start() {
        let transport = TcpTransport::new();
        transport.initialize(&TransportOptions::default()).unwrap();
        let err = transport
            .send(b"x", "127.0.0.1:9".parse().unwrap(), &SendOptions::default())
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState { .. }));
    }
}
