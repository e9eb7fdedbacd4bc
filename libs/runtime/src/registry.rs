//! Process Registry
//!
//! Maps process type names to spawn functions, so a node can start
//! children of a type named in a `New` command. The registry is built by
//! the program and handed to [`Runtime::start`](crate::Runtime::start);
//! nothing is registered globally.

use crate::error::Result;
use crate::process::{DistProcess, ProcessType};
use crate::runtime::Runtime;
use std::collections::HashMap;
use std::thread::JoinHandle;
use tracing::warn;
use types::{Command, ProcessId, SetupRequest};

/// What a spawn function needs to start one child.
pub(crate) struct SpawnSpec {
    pub runtime: Runtime,
    pub parent: ProcessId,
    pub name: Option<String>,
    /// Requester to acknowledge and the setup to perform on start
    pub setup: Option<(ProcessId, SetupRequest)>,
}

pub(crate) type SpawnFn = fn(SpawnSpec) -> Result<(ProcessId, JoinHandle<()>)>;

#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    spawners: HashMap<String, SpawnFn>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `P` spawnable under [`ProcessType::TYPE_NAME`].
    pub fn register<P: ProcessType>(&mut self) -> &mut Self {
        let spawn: SpawnFn = DistProcess::<P>::spawn;
        if self.spawners.insert(P::TYPE_NAME.to_string(), spawn).is_some() {
            warn!(pid_type = P::TYPE_NAME, "Process type registered twice; keeping the latest");
        }
        self
    }

    pub fn with<P: ProcessType>(mut self) -> Self {
        self.register::<P>();
        self
    }

    pub fn contains(&self, pid_type: &str) -> bool {
        self.spawners.contains_key(pid_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.spawners.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub(crate) fn spawner(&self, pid_type: &str) -> Option<SpawnFn> {
        self.spawners.get(pid_type).copied()
    }
}

/// A request for new processes, as sent to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawn {
    pub pid_type: String,
    pub count: usize,
    /// Names for the first processes; extends `count` when longer
    pub names: Vec<String>,
    /// Node to spawn at; the local node when `None`
    pub at: Option<ProcessId>,
}

impl Spawn {
    pub fn new(pid_type: impl Into<String>) -> Self {
        Self {
            pid_type: pid_type.into(),
            count: 1,
            names: Vec::new(),
            at: None,
        }
    }

    pub fn of<P: ProcessType>() -> Self {
        Self::new(P::TYPE_NAME)
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn named<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn at(mut self, node: ProcessId) -> Self {
        self.at = Some(node);
        self
    }

    /// Number of processes this request asks for.
    pub fn total(&self) -> usize {
        self.count.max(self.names.len())
    }

    pub(crate) fn to_command(&self, seqno: u64, setup: Option<SetupRequest>) -> Command {
        Command::New {
            seqno,
            pid_type: self.pid_type.clone(),
            count: self.count,
            names: self.names.clone(),
            setup,
        }
    }
}
