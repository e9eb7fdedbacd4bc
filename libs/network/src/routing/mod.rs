//! Message Routing Module
//!
//! The [`Router`] decides, per envelope, between delivery to a process hosted
//! by this runtime and forwarding through a transport. It also runs the
//! control protocol (HELLO/ACK/PING/BYE) that nodes use to find each other.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod router;

pub use router::{Delivery, Mailbox, Router, RouterState};

/// Router statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub local_deliveries: u64,
    pub forwarded: u64,
    /// Envelopes parked until the router starts or the process registers
    pub pending: u64,
    pub dropped: u64,
    pub control_messages: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RouterCounters {
    local_deliveries: AtomicU64,
    forwarded: AtomicU64,
    pending: AtomicU64,
    dropped: AtomicU64,
    control_messages: AtomicU64,
}

impl RouterCounters {
    pub(crate) fn local_delivery(&self) {
        self.local_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pending(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn control(&self) {
        self.control_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RouterStats {
        RouterStats {
            local_deliveries: self.local_deliveries.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            control_messages: self.control_messages.load(Ordering::Relaxed),
        }
    }
}
