//! Transport Metrics
//!
//! Lock-free counters updated on the send and receive paths, plus a small
//! error-category table. Readers take a [`MetricsSnapshot`].

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Counters for one transport
#[derive(Clone, Default)]
pub struct MetricsTracker {
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    auth_failures: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    retries: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,

    /// Error type tracking
    error_types: Arc<RwLock<HashMap<&'static str, u64>>>,

    last_send: Arc<RwLock<Option<Instant>>>,
    last_receive: Arc<RwLock<Option<Instant>>>,
}

/// Point-in-time copy of a [`MetricsTracker`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub auth_failures: u64,
    pub dropped: u64,
    pub retries: u64,
    pub errors: u64,
    pub error_types: HashMap<&'static str, u64>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed send
    #[inline]
    pub fn record_send(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_send.write() = Some(Instant::now());
    }

    /// Record a payload delivered to the inbound queue
    #[inline]
    pub fn record_receive(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_receive.write() = Some(Instant::now());
    }

    /// Packet or handshake rejected for a bad digest or version
    #[inline]
    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
        self.record_drop();
    }

    /// Inbound packet discarded
    #[inline]
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error under its category
    pub fn record_error(&self, category: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.error_types.write().entry(category).or_insert(0) += 1;
    }

    pub fn last_send(&self) -> Option<Instant> {
        *self.last_send.read()
    }

    pub fn last_receive(&self) -> Option<Instant> {
        *self.last_receive.read()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            error_types: self.error_types.read().clone(),
        }
    }
}
