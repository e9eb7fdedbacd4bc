//! Message Router
//!
//! One router per runtime instance. It owns the [`TransportManager`], a
//! table of the processes hosted locally, and a background thread that
//! drains the inbound queue.
//!
//! ## Delivery rules
//!
//! - destination registered locally: push to its mailbox
//! - router not running yet: park the envelope and replay it on start
//! - destination hosted at this router's own addresses but unknown:
//!   [`TransportError::CircularRouting`], never a network send
//! - otherwise: encode and forward on the first transport whose
//!   capabilities fit the request
//!
//! Envelopes without a destination are control messages for the router
//! itself. A router never forwards what it received; inbound envelopes for
//! processes it does not host are dropped.

use super::{RouterCounters, RouterStats};
use crate::protocol::{decode_envelope, encode_envelope};
use crate::transports::{
    resolve, InboundPacket, SendOptions, TransportKind, TransportManager, TransportOptions,
};
use crate::{Result, TransportError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use runtime_config::defaults::routing;
use runtime_config::RuntimeConfig;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use types::{ChannelCaps, Command, Control, Envelope, Payload, ProcessId};

/// A command handed to a local process
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub src: Option<ProcessId>,
    pub command: Command,
}

/// Inbound queue of one local process
pub type Mailbox = Sender<Delivery>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    NotRunning,
    Running,
    Stopped,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RouterState::NotRunning => "not running",
            RouterState::Running => "running",
            RouterState::Stopped => "stopped",
        })
    }
}

pub struct Router {
    name: String,
    config: RuntimeConfig,
    default_caps: ChannelCaps,
    transports: TransportManager,
    state: Mutex<RouterState>,
    node: RwLock<Option<ProcessId>>,
    local: Mutex<HashMap<ProcessId, Mailbox>>,
    pending: Mutex<Vec<(Envelope, ChannelCaps)>>,
    names: RwLock<HashMap<String, ProcessId>>,
    peers: RwLock<HashSet<ProcessId>>,
    /// ACKs with the address they arrived from
    acks_tx: Sender<(Option<SocketAddr>, ProcessId)>,
    acks_rx: Receiver<(Option<SocketAddr>, ProcessId)>,
    thread: Mutex<Option<JoinHandle<()>>>,
    counters: RouterCounters,
}

impl Router {
    /// Router named `name`, with the default UDP and TCP transports.
    pub fn new(name: impl Into<String>, config: RuntimeConfig) -> Result<Self> {
        let name = name.into();
        let default_caps = config
            .default_caps()
            .map_err(|e| TransportError::configuration(e.to_string(), Some("default_channel")))?;
        let (acks_tx, acks_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            transports: TransportManager::new(&name),
            name,
            config,
            default_caps,
            state: Mutex::new(RouterState::NotRunning),
            node: RwLock::new(None),
            local: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            names: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashSet::new()),
            acks_tx,
            acks_rx,
            thread: Mutex::new(None),
            counters: RouterCounters::default(),
        })
    }

    /// Bind and start the transports, mint the node id and start draining
    /// the inbound queue. Parked envelopes are replayed afterwards.
    pub fn start(self: &Arc<Self>) -> Result<ProcessId> {
        {
            let state = self.state.lock();
            if *state != RouterState::NotRunning {
                return Err(TransportError::invalid_state("start router", *state));
            }
        }

        self.transports
            .initialize(&TransportOptions::from(&self.config))?;
        self.transports.start()?;

        let node = self.new_process_id(routing::NODE_TYPE, Some(self.name.clone()));
        *self.node.write() = Some(node.clone());
        *self.state.lock() = RouterState::Running;

        let router = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("{}-router", self.name))
            .spawn(move || router.run());
        match spawned {
            Ok(thread) => *self.thread.lock() = Some(thread),
            Err(e) => {
                *self.state.lock() = RouterState::Stopped;
                self.transports.close();
                return Err(TransportError::network_with_source(
                    "failed to spawn router thread",
                    e,
                ));
            }
        }
        info!(router = %self.name, node = ?node, "router started");

        let parked = std::mem::take(&mut *self.pending.lock());
        if !parked.is_empty() {
            debug!(count = parked.len(), "replaying parked envelopes");
        }
        for (envelope, caps) in parked {
            let Envelope { src, dest, payload } = envelope;
            if let Err(e) = self.send(src.as_ref(), dest.as_ref(), payload, caps) {
                warn!(error = %e, "Replay of parked envelope failed");
                self.counters.dropped();
            }
        }
        Ok(node)
    }

    /// Say BYE to every peer, stop the router thread and close the
    /// transports. Safe to call repeatedly.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                RouterState::Stopped => return,
                RouterState::NotRunning => {
                    *state = RouterState::Stopped;
                    drop(state);
                    self.transports.close();
                    return;
                }
                RouterState::Running => {}
            }
        }

        if let Some(node) = self.node_id() {
            let bye = Envelope::new(Some(node.clone()), None, Control::Bye { node }.into());
            for peer in self.peers() {
                if let Err(e) = self.forward(&bye, &peer, self.default_caps) {
                    debug!(peer = ?peer, error = %e, "BYE not delivered");
                }
            }
        }

        *self.state.lock() = RouterState::Stopped;
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!(router = %self.name, "router thread panicked");
            }
        }
        self.transports.close();
        info!(router = %self.name, stats = ?self.stats(), "router stopped");
    }

    pub fn state(&self) -> RouterState {
        *self.state.lock()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Capabilities used when a caller does not ask for specific ones.
    pub fn default_caps(&self) -> ChannelCaps {
        self.default_caps
    }

    /// Id of this router's node, once started.
    pub fn node_id(&self) -> Option<ProcessId> {
        self.node.read().clone()
    }

    pub fn transports(&self) -> &TransportManager {
        &self.transports
    }

    /// Mint an id hosted by this router.
    pub fn new_process_id(&self, pid_type: &str, name: Option<String>) -> ProcessId {
        ProcessId::new(
            pid_type,
            name,
            self.config.hostname.clone(),
            self.transports.addresses(),
        )
    }

    /// Add `id` to the local delivery table and hand it any envelopes that
    /// were parked for it.
    pub fn register_local_process(&self, id: ProcessId, mailbox: Mailbox) {
        if self.local.lock().insert(id.clone(), mailbox.clone()).is_some() {
            warn!(process = ?id, "process registered twice");
        }
        if let Some(name) = id.name() {
            self.names.write().insert(name.to_string(), id.clone());
        }
        debug!(process = %id, "registered local process");

        let parked: Vec<Envelope> = {
            let mut pending = self.pending.lock();
            let (mine, rest): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|(envelope, _)| envelope.dest.as_ref() == Some(&id));
            *pending = rest;
            mine.into_iter().map(|(envelope, _)| envelope).collect()
        };
        for envelope in parked {
            if let Payload::Command(command) = envelope.payload {
                self.deliver(&mailbox, &id, envelope.src, command);
            }
        }
    }

    pub fn deregister_local_process(&self, id: &ProcessId) {
        if self.local.lock().remove(id).is_none() {
            debug!(process = %id, "deregistering unknown process");
            return;
        }
        if let Some(name) = id.name() {
            let mut names = self.names.write();
            if names.get(name) == Some(id) {
                names.remove(name);
            }
        }
        debug!(process = %id, "deregistered local process");
    }

    pub fn is_local(&self, id: &ProcessId) -> bool {
        self.local.lock().contains_key(id)
    }

    /// Id registered under `name`, locally or by a peer.
    pub fn resolve_name(&self, name: &str) -> Option<ProcessId> {
        self.names.read().get(name).cloned()
    }

    /// Peer nodes currently known.
    pub fn peers(&self) -> Vec<ProcessId> {
        self.peers.read().iter().cloned().collect()
    }

    pub fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }

    /// Route one payload.
    ///
    /// A command needs a destination. A control message without a
    /// destination is handled by this router; with one it is forwarded to
    /// that node's router.
    pub fn send(
        &self,
        src: Option<&ProcessId>,
        dest: Option<&ProcessId>,
        payload: Payload,
        caps: ChannelCaps,
    ) -> Result<()> {
        let (dest, command) = match (dest, payload) {
            (None, Payload::Control(control)) => {
                self.counters.control();
                self.handle_control(src.cloned(), control, None);
                return Ok(());
            }
            (None, Payload::Command(command)) => {
                return Err(TransportError::protocol(format!(
                    "{} command without destination",
                    command.kind()
                )));
            }
            (Some(dest), Payload::Control(control)) => {
                let envelope = Envelope::new(src.cloned(), None, control.into());
                return self.forward(&envelope, dest, caps);
            }
            (Some(dest), Payload::Command(command)) => (dest, command),
        };

        if let Some(mailbox) = self.mailbox(dest) {
            self.deliver(&mailbox, dest, src.cloned(), command);
            return Ok(());
        }

        let envelope = Envelope::new(src.cloned(), Some(dest.clone()), command.into());
        if self.state() == RouterState::NotRunning {
            trace!(dest = %dest, "router not running; parking envelope");
            self.pending.lock().push((envelope, caps));
            self.counters.pending();
            return Ok(());
        }
        self.forward(&envelope, dest, caps)
    }

    /// Send HELLO to `host:port` on each transport in turn until the peer
    /// there answers with ACK. Returns the peer's node id. ACKs arriving
    /// from any other address do not count.
    pub fn bootstrap_node(&self, host: &str, port: u16, timeout: Duration) -> Result<ProcessId> {
        let Some(node) = self.node_id() else {
            return Err(TransportError::invalid_state("bootstrap", self.state()));
        };
        let target = resolve(host, port)?;
        while self.acks_rx.try_recv().is_ok() {}

        let hello = encode_envelope(&Envelope::new(
            Some(node),
            None,
            Control::Hello {
                known: self.local_named(),
            }
            .into(),
        ))?;
        for transport in self.transports.transports() {
            if let Err(e) = transport.send(&hello, target, &SendOptions::default()) {
                debug!(kind = %transport.kind(), %target, error = %e, "HELLO not sent");
                continue;
            }
            match self.await_ack(target, timeout) {
                Some(peer) => {
                    info!(peer = ?peer, kind = %transport.kind(), "bootstrapped");
                    return Ok(peer);
                }
                None => debug!(kind = %transport.kind(), %target, "no ACK before timeout"),
            }
        }
        Err(TransportError::bootstrap(
            host,
            port,
            "no peer answered HELLO on any transport",
        ))
    }

    fn await_ack(&self, target: SocketAddr, timeout: Duration) -> Option<ProcessId> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match self.acks_rx.recv_timeout(remaining) {
                Ok((Some(remote), peer)) if remote == target => return Some(peer),
                Ok((remote, peer)) => {
                    debug!(?remote, peer = ?peer, %target, "Ignoring ACK from another address")
                }
                Err(_) => return None,
            }
        }
    }

    /// PING every known peer with our named processes. Returns how many
    /// pings were sent.
    pub fn ping_peers(&self) -> usize {
        let Some(node) = self.node_id() else {
            return 0;
        };
        let ping = Envelope::new(
            Some(node),
            None,
            Control::Ping {
                ids: self.local_named(),
            }
            .into(),
        );
        let mut sent = 0;
        for peer in self.peers() {
            match self.forward(&ping, &peer, self.default_caps) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = ?peer, error = %e, "PING failed"),
            }
        }
        sent
    }

    fn run(&self) {
        let inbound = self.transports.inbound().clone();
        let poll = Duration::from_millis(routing::POLL_INTERVAL_MS);
        debug!(router = %self.name, "router thread running");
        while self.state() == RouterState::Running {
            match inbound.recv_timeout(poll) {
                Ok(packet) => self.dispatch(packet),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(router = %self.name, "router thread exiting");
    }

    fn dispatch(&self, packet: InboundPacket) {
        let envelope = match decode_envelope(&packet.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(remote = %packet.remote, error = %e, "Undecodable envelope dropped");
                self.counters.dropped();
                return;
            }
        };

        match (envelope.dest, envelope.payload) {
            (None, Payload::Control(control)) => {
                self.counters.control();
                trace!(kind = %control.kind(), remote = %packet.remote, "control message");
                self.handle_control(envelope.src, control, Some((packet.kind, packet.remote)));
            }
            (Some(dest), Payload::Command(command)) => match self.mailbox(&dest) {
                Some(mailbox) => self.deliver(&mailbox, &dest, envelope.src, command),
                None => {
                    debug!(dest = %dest, "No local process for inbound message");
                    self.counters.dropped();
                }
            },
            (dest, _) => {
                warn!(remote = %packet.remote, dest = ?dest, "Malformed envelope dropped");
                self.counters.dropped();
            }
        }
    }

    fn handle_control(
        &self,
        src: Option<ProcessId>,
        control: Control,
        origin: Option<(TransportKind, SocketAddr)>,
    ) {
        match control {
            Control::Hello { known } => {
                self.merge_names(known);
                if let Some(peer) = src {
                    self.add_peer(peer);
                }
                let (Some(node), Some((kind, remote))) = (self.node_id(), origin) else {
                    debug!("HELLO without a reply path ignored");
                    return;
                };
                let ack = Envelope::new(
                    Some(node.clone()),
                    None,
                    Control::Ack {
                        node,
                        known: self.local_named(),
                    }
                    .into(),
                );
                if let Err(e) = self.reply(kind, remote, &ack) {
                    warn!(%remote, error = %e, "Failed to answer HELLO");
                }
            }
            Control::Ack { node, known } => {
                self.merge_names(known);
                self.add_peer(node.clone());
                // nobody may be bootstrapping; the queue is drained on the next attempt
                let _ = self.acks_tx.send((origin.map(|(_, remote)| remote), node));
            }
            Control::Ping { ids } => {
                self.merge_names(ids);
                if let Some(peer) = src {
                    self.add_peer(peer);
                }
            }
            Control::Bye { node } => {
                self.peers.write().remove(&node);
                self.names
                    .write()
                    .retain(|_, id| !id.is_hosted_at(node.hostname(), node.transports()));
                info!(peer = ?node, "peer left");
            }
        }
    }

    fn reply(&self, kind: TransportKind, remote: SocketAddr, envelope: &Envelope) -> Result<()> {
        let transport = self
            .transports
            .slot_of(kind)
            .and_then(|slot| self.transports.transport(slot))
            .ok_or(TransportError::NoAvailableTransport {
                caps: ChannelCaps::empty(),
            })?;
        let bytes = encode_envelope(envelope)?;
        transport.send(&bytes, remote, &SendOptions::default())
    }

    fn forward(&self, envelope: &Envelope, dest: &ProcessId, caps: ChannelCaps) -> Result<()> {
        if dest.is_hosted_at(&self.config.hostname, &self.transports.addresses()) {
            self.counters.dropped();
            return Err(TransportError::CircularRouting {
                dest: dest.to_string(),
            });
        }
        let transport = self
            .transports
            .get_transport(caps)
            .ok_or(TransportError::NoAvailableTransport { caps })?;
        let slot = self
            .transports
            .slot_of(transport.kind())
            .unwrap_or_else(|| transport.kind().slot());
        let (host, port) = dest
            .address(slot)
            .ok_or_else(|| TransportError::NoTargetTransport {
                dest: dest.to_string(),
                slot,
            })?;
        let target = resolve(host, port)?;
        let bytes = encode_envelope(envelope)?;
        let options = SendOptions {
            retry_refused: self.config.retry_refused_connections,
        };
        transport.send(&bytes, target, &options)?;
        self.counters.forwarded();
        trace!(dest = %dest, %target, kind = %transport.kind(), bytes = bytes.len(), "forwarded");
        Ok(())
    }

    fn mailbox(&self, id: &ProcessId) -> Option<Mailbox> {
        self.local.lock().get(id).cloned()
    }

    fn deliver(
        &self,
        mailbox: &Mailbox,
        dest: &ProcessId,
        src: Option<ProcessId>,
        command: Command,
    ) {
        if mailbox.send(Delivery { src, command }).is_err() {
            warn!(dest = %dest, "Mailbox closed; message dropped");
            self.counters.dropped();
        } else {
            self.counters.local_delivery();
        }
    }

    /// Named processes hosted here, advertised to peers.
    fn local_named(&self) -> Vec<ProcessId> {
        self.local
            .lock()
            .keys()
            .filter(|id| id.name().is_some())
            .cloned()
            .collect()
    }

    fn merge_names(&self, ids: Vec<ProcessId>) {
        let local = self.local.lock();
        let mut names = self.names.write();
        for id in ids {
            let Some(name) = id.name() else {
                continue;
            };
            if names.get(name).is_some_and(|known| local.contains_key(known)) {
                continue;
            }
            names.insert(name.to_string(), id);
        }
    }

    fn add_peer(&self, peer: ProcessId) {
        if self.node.read().as_ref() == Some(&peer) {
            return;
        }
        if self.peers.write().insert(peer.clone()) {
            debug!(peer = ?peer, "new peer");
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("node", &self.node_id())
            .finish_non_exhaustive()
    }
}
