//! Process identifiers
//!
//! A [`ProcessId`] is the addressing unit for local and remote delivery. It
//! bundles a random unique id with the hostname and per-transport listen
//! ports of the router hosting the process, so any holder can reach the
//! process without consulting a directory.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Globally unique, immutable process identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId {
    uid: u64,
    pid_type: String,
    name: Option<String>,
    hostname: String,
    transports: Vec<Option<u16>>,
}

impl ProcessId {
    /// Mint a new identifier with a fresh random uid.
    ///
    /// `transports` holds one entry per transport slot of the hosting router;
    /// `None` marks a slot whose transport is unavailable.
    pub fn new(
        pid_type: impl Into<String>,
        name: Option<String>,
        hostname: impl Into<String>,
        transports: Vec<Option<u16>>,
    ) -> Self {
        Self::with_uid(rand::random(), pid_type, name, hostname, transports)
    }

    /// Build an identifier with an explicit uid.
    pub fn with_uid(
        uid: u64,
        pid_type: impl Into<String>,
        name: Option<String>,
        hostname: impl Into<String>,
        transports: Vec<Option<u16>>,
    ) -> Self {
        Self {
            uid,
            pid_type: pid_type.into(),
            name,
            hostname: hostname.into(),
            transports,
        }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Name of the process type this id was created for.
    pub fn pid_type(&self) -> &str {
        &self.pid_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Per-slot transport ports.
    pub fn transports(&self) -> &[Option<u16>] {
        &self.transports
    }

    /// Host and port to reach this process through transport `slot`.
    pub fn address(&self, slot: usize) -> Option<(&str, u16)> {
        self.transports
            .get(slot)
            .copied()
            .flatten()
            .map(|port| (self.hostname.as_str(), port))
    }

    /// True when this id is hosted at exactly the given addresses.
    pub fn is_hosted_at(&self, hostname: &str, transports: &[Option<u16>]) -> bool {
        self.hostname == hostname && self.transports == transports
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "<{}:{}>", self.pid_type, name),
            None => write!(f, "<{}:{:012x}>", self.pid_type, self.uid & 0xffff_ffff_ffff),
        }
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}{:?}", self, self.hostname, self.transports)
    }
}
