//! Transport Manager
//!
//! Owns the ordered transport slots of one runtime instance together with
//! the message loop that drives them and the inbound queue they feed.
//! Lifecycle calls fan out to every slot; a slot whose transport fails is
//! logged and marked unavailable, and only the loss of every slot is fatal.

use super::{
    InboundReceiver, InboundSender, TcpTransport, Transport, TransportKind, TransportOptions,
    UdpTransport,
};
use crate::mesgloop::MessageLoop;
use crate::{Result, TransportError};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use types::ChannelCaps;

pub struct TransportManager {
    slots: RwLock<Vec<Option<Arc<dyn Transport>>>>,
    mesgloop: MessageLoop,
    inbound_tx: InboundSender,
    inbound_rx: InboundReceiver,
}

impl TransportManager {
    /// Manager with the default slots: UDP then TCP.
    pub fn new(name: &str) -> Self {
        Self::with_transports(
            name,
            vec![
                Arc::new(UdpTransport::new()) as Arc<dyn Transport>,
                Arc::new(TcpTransport::new()),
            ],
        )
    }

    /// Manager over an explicit slot list. Slot order is the order of
    /// `transports` and must agree with every peer's.
    pub fn with_transports(name: &str, transports: Vec<Arc<dyn Transport>>) -> Self {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        Self {
            slots: RwLock::new(transports.into_iter().map(Some).collect()),
            mesgloop: MessageLoop::new(format!("{name}-mesgloop")),
            inbound_tx,
            inbound_rx,
        }
    }

    /// Bind every transport.
    pub fn initialize(&self, options: &TransportOptions) -> Result<()> {
        self.fan_out("initialize", |transport| transport.initialize(options))
    }

    /// Start the message loop and every initialized transport.
    pub fn start(&self) -> Result<()> {
        self.mesgloop.start()?;
        let started = self.fan_out("start", |transport| {
            transport.start(self.inbound_tx.clone(), &self.mesgloop)
        });
        if started.is_err() {
            self.mesgloop.stop();
        }
        started
    }

    /// Close every transport, then stop the loop.
    pub fn close(&self) {
        for transport in self.slots.read().iter().flatten() {
            transport.close();
        }
        self.mesgloop.stop();
        info!("transports closed");
    }

    /// First available transport whose unsupported mask does not conflict
    /// with `caps`. Broadcast is not a transport property and is ignored.
    pub fn get_transport(&self, caps: ChannelCaps) -> Option<Arc<dyn Transport>> {
        let caps = caps - ChannelCaps::BROADCAST;
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|transport| transport.unsupported().admits(caps))
            .cloned()
    }

    /// Transport in `slot`, if available.
    pub fn transport(&self, slot: usize) -> Option<Arc<dyn Transport>> {
        self.slots.read().get(slot).cloned().flatten()
    }

    /// Every available transport, in slot order.
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Listen port of every slot, `None` for unavailable ones.
    pub fn addresses(&self) -> Vec<Option<u16>> {
        self.slots
            .read()
            .iter()
            .map(|slot| slot.as_ref().and_then(|t| t.address()))
            .collect()
    }

    /// Slot index of the first available transport of `kind`.
    pub fn slot_of(&self, kind: TransportKind) -> Option<usize> {
        self.slots
            .read()
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|t| t.kind() == kind))
    }

    /// Queue every started transport delivers into.
    pub fn inbound(&self) -> &InboundReceiver {
        &self.inbound_rx
    }

    pub fn mesgloop(&self) -> &MessageLoop {
        &self.mesgloop
    }

    fn fan_out(
        &self,
        operation: &str,
        mut apply: impl FnMut(&Arc<dyn Transport>) -> Result<()>,
    ) -> Result<()> {
        let mut slots = self.slots.write();
        let mut last_error = None;
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(transport) = slot else {
                continue;
            };
            match apply(transport) {
                Ok(()) => {
                    debug!(slot = index, kind = %transport.kind(), "transport {operation} ok")
                }
                Err(e) => {
                    warn!(
                        slot = index,
                        kind = %transport.kind(),
                        error = %e,
                        "Failed to {operation} transport"
                    );
                    transport.close();
                    *slot = None;
                    last_error = Some(e);
                }
            }
        }

        if slots.iter().all(Option::is_none) {
            error!("All transports failed to {operation}");
            return Err(match last_error {
                Some(e) => e,
                None => TransportError::network("no transports configured"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_selection() {
        let manager = TransportManager::new("caps");
        let udp = manager.get_transport(ChannelCaps::INTERHOST).unwrap();
        assert_eq!(udp.kind(), TransportKind::Udp);

        let tcp = manager.get_transport(ChannelCaps::RELIABLE_FIFO).unwrap();
        assert_eq!(tcp.kind(), TransportKind::Tcp);

        let broadcast = manager
            .get_transport(ChannelCaps::BROADCAST | ChannelCaps::INTERHOST)
            .unwrap();
        assert_eq!(broadcast.kind(), TransportKind::Udp);
    }

    #[test]
    fn test_empty_manager_has_nothing_to_offer() {
        let manager = TransportManager::with_transports("empty", Vec::new());
        assert!(manager.get_transport(ChannelCaps::empty()).is_none());
        assert!(manager.initialize(&TransportOptions::default()).is_err());
    }
}
