//! Async Command Correlation
//!
//! Matches acknowledgements back to the request that caused them. An entry
//! is registered before the request is sent and starts out accumulating:
//! acks that arrive before the issuer knows whom to wait for are kept. Once
//! the participant set is supplied, accumulated acks are checked against it
//! and the entry completes when every participant has answered.

use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};
use types::{CommandKind, ProcessId, Term};

static NEXT_THREAD_INDEX: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_INDEX: u64 = NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed);
    static COUNTER: Cell<u32> = const { Cell::new(0) };
}

/// Sequence number unique within this runtime: the calling thread's index
/// in the high half, a per-thread counter in the low half.
pub fn next_seqno() -> u64 {
    let index = THREAD_INDEX.with(|i| *i);
    let counter = COUNTER.with(|c| {
        let next = c.get().wrapping_add(1);
        c.set(next);
        next
    });
    (index << 32) | u64::from(counter)
}

/// Replies collected for one request, in arrival order.
pub type AckResults = Vec<(ProcessId, Term)>;

#[derive(Debug)]
enum Entry {
    /// Participants not known yet
    Accumulating(AckResults),
    Waiting {
        remaining: HashSet<ProcessId>,
        results: AckResults,
    },
}

/// Per-command-kind maps from sequence number to correlation entry.
#[derive(Debug)]
pub struct CorrelationTable {
    maps: [Mutex<HashMap<u64, Entry>>; CommandKind::COUNT],
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            maps: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn map(&self, kind: CommandKind) -> &Mutex<HashMap<u64, Entry>> {
        &self.maps[kind.index()]
    }

    /// Open an empty entry. Must happen before the request goes out.
    pub fn register(&self, kind: CommandKind, seqno: u64) {
        self.map(kind)
            .lock()
            .insert(seqno, Entry::Accumulating(Vec::new()));
    }

    /// Record one reply. Returns `false` for replies nobody is waiting for.
    pub fn record_ack(&self, kind: CommandKind, seqno: u64, src: ProcessId, result: Term) -> bool {
        let mut map = self.map(kind).lock();
        match map.get_mut(&seqno) {
            None => {
                debug!(%kind, seqno, src = %src, "Ack for unknown request ignored");
                false
            }
            Some(Entry::Accumulating(acks)) => {
                trace!(%kind, seqno, src = %src, "Ack accumulated");
                acks.push((src, result));
                true
            }
            Some(Entry::Waiting { remaining, results }) => {
                if remaining.remove(&src) {
                    results.push((src, result));
                } else {
                    debug!(%kind, seqno, src = %src, "Ack from unexpected participant ignored");
                }
                true
            }
        }
    }

    /// Supply the participant set. Acks already accumulated from
    /// participants count; acks from anyone else are discarded.
    pub fn set_participants(
        &self,
        kind: CommandKind,
        seqno: u64,
        participants: impl IntoIterator<Item = ProcessId>,
    ) -> bool {
        let mut map = self.map(kind).lock();
        let Some(entry) = map.get_mut(&seqno) else {
            return false;
        };
        let Entry::Accumulating(acks) = entry else {
            debug!(%kind, seqno, "Participants already known");
            return false;
        };

        let mut remaining: HashSet<ProcessId> = participants.into_iter().collect();
        let mut results = Vec::with_capacity(remaining.len());
        for (src, result) in std::mem::take(acks) {
            if remaining.remove(&src) {
                results.push((src, result));
            } else {
                debug!(%kind, seqno, src = %src, "Accumulated ack from non-participant dropped");
            }
        }
        *entry = Entry::Waiting { remaining, results };
        true
    }

    /// True once the participant set is known and every member answered.
    pub fn is_complete(&self, kind: CommandKind, seqno: u64) -> bool {
        matches!(
            self.map(kind).lock().get(&seqno),
            Some(Entry::Waiting { remaining, .. }) if remaining.is_empty()
        )
    }

    /// Remove a complete entry and return its replies.
    pub fn take_results(&self, kind: CommandKind, seqno: u64) -> Option<AckResults> {
        let mut map = self.map(kind).lock();
        let complete = matches!(
            map.get(&seqno),
            Some(Entry::Waiting { remaining, .. }) if remaining.is_empty()
        );
        if !complete {
            return None;
        }
        match map.remove(&seqno) {
            Some(Entry::Waiting { results, .. }) => Some(results),
            _ => None,
        }
    }

    /// Participants still to answer, when known.
    pub fn outstanding(&self, kind: CommandKind, seqno: u64) -> Option<Vec<ProcessId>> {
        match self.map(kind).lock().get(&seqno) {
            Some(Entry::Waiting { remaining, .. }) => Some(remaining.iter().cloned().collect()),
            _ => None,
        }
    }

    /// Drop an entry; later replies are ignored.
    pub fn cancel(&self, kind: CommandKind, seqno: u64) -> bool {
        self.map(kind).lock().remove(&seqno).is_some()
    }

    /// Number of open entries across all kinds.
    pub fn len(&self) -> usize {
        self.maps.iter().map(|m| m.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
