//! Per-process statistics
//!
//! Counters a process keeps about itself, read as a [`StatsSnapshot`].
//! Byte counts live with the transports; see [`crate::Runtime::transport_metrics`].

use serde::Serialize;
use std::time::{Duration, Instant};
use types::CommandKind;

#[derive(Debug, Default)]
pub(crate) struct ProcessStats {
    messages_sent: u64,
    messages_received: u64,
    messages_dropped: u64,
    handler_failures: u64,
    acks: [u64; CommandKind::COUNT],
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

impl ProcessStats {
    pub(crate) fn sent(&mut self, count: usize) {
        self.messages_sent += count as u64;
    }

    pub(crate) fn received(&mut self) {
        self.messages_received += 1;
    }

    pub(crate) fn dropped(&mut self) {
        self.messages_dropped += 1;
    }

    pub(crate) fn handler_failed(&mut self) {
        self.handler_failures += 1;
    }

    pub(crate) fn ack(&mut self, kind: CommandKind) {
        self.acks[kind.index()] += 1;
    }

    /// Start the timer; a second start restarts it.
    pub(crate) fn start_timer(&mut self) {
        self.started = Some(Instant::now());
        self.elapsed = None;
    }

    pub(crate) fn stop_timer(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed = Some(started.elapsed());
        }
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            messages_dropped: self.messages_dropped,
            handler_failures: self.handler_failures,
            acks: CommandKind::ALL
                .iter()
                .filter(|kind| self.acks[kind.index()] > 0)
                .map(|kind| (kind.to_string(), self.acks[kind.index()]))
                .collect(),
            elapsed: self
                .elapsed
                .or_else(|| self.started.map(|s| s.elapsed())),
        }
    }
}

/// Point-in-time copy of a process's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Dropped by simulated send or receive failures
    pub messages_dropped: u64,
    pub handler_failures: u64,
    /// Acks received, by acknowledgement kind
    pub acks: Vec<(String, u64)>,
    /// Time between the `start` and `end` labels, or since `start` while running
    pub elapsed: Option<Duration>,
}

impl StatsSnapshot {
    pub fn acks_of(&self, kind: CommandKind) -> u64 {
        let name = kind.to_string();
        self.acks
            .iter()
            .find(|(k, _)| *k == name)
            .map_or(0, |(_, n)| *n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lists_only_seen_acks() {
        let mut stats = ProcessStats::default();
        stats.ack(CommandKind::SetupAck);
        stats.ack(CommandKind::SetupAck);
        stats.ack(CommandKind::EndAck);
        stats.sent(3);
        let snap = stats.snapshot();
        assert_eq!(snap.messages_sent, 3);
        assert_eq!(snap.acks.len(), 2);
        assert_eq!(snap.acks_of(CommandKind::SetupAck), 2);
        assert_eq!(snap.acks_of(CommandKind::NewAck), 0);
        assert!(snap.elapsed.is_none());
    }

    #[test]
    fn timer_runs_between_start_and_stop() {
        let mut stats = ProcessStats::default();
        stats.stop_timer();
        assert!(stats.snapshot().elapsed.is_none());
        stats.start_timer();
        assert!(stats.snapshot().elapsed.is_some());
        stats.stop_timer();
        let first = stats.snapshot().elapsed;
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(stats.snapshot().elapsed, first);
    }
}
