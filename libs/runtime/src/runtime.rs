//! Runtime Context
//!
//! One [`Runtime`] per node: the router with its transports, the process
//! registry and the threads of the children spawned here. It is a cheap
//! handle; every process holds a clone.

use crate::error::{ProcessError, Result};
use crate::node::Node;
use crate::process::{DistProcess, Phase, ProcessType};
use crate::registry::{ProcessRegistry, SpawnSpec};
use network::transports::MetricsSnapshot;
use network::{Router, TransportKind};
use parking_lot::Mutex;
use runtime_config::RuntimeConfig;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use types::{ProcessId, SetupRequest};

const REAP_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    router: Arc<Router>,
    registry: ProcessRegistry,
    node_id: ProcessId,
    node_taken: AtomicBool,
    children: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Validate `config`, start the router and its transports.
    pub fn start(
        name: impl Into<String>,
        config: RuntimeConfig,
        registry: ProcessRegistry,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ProcessError::Config(format!("{e:#}")))?;
        let router = Arc::new(Router::new(name, config.clone())?);
        let node_id = router.start()?;
        info!(node = ?node_id, types = ?registry.types(), "Runtime started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                router,
                registry,
                node_id,
                node_taken: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The node process of this runtime, driven by the calling thread.
    ///
    /// There is one node process per runtime; a second call fails.
    pub fn node(&self) -> Result<DistProcess<Node>> {
        if self.inner.node_taken.swap(true, Ordering::AcqRel) {
            return Err(ProcessError::Config("node process already taken".into()));
        }
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner
            .router
            .register_local_process(self.inner.node_id.clone(), tx);
        Ok(DistProcess::new(
            self.clone(),
            self.inner.node_id.clone(),
            None,
            rx,
            Phase::Running,
        ))
    }

    /// A process of type `P` driven by the calling thread, as a child of
    /// the node. It is running from the start; no setup is performed.
    pub fn attach<P: ProcessType>(&self, name: Option<String>) -> DistProcess<P> {
        let id = self.inner.router.new_process_id(P::TYPE_NAME, name);
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.router.register_local_process(id.clone(), tx);
        DistProcess::new(
            self.clone(),
            id,
            Some(self.inner.node_id.clone()),
            rx,
            Phase::Running,
        )
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    pub fn node_id(&self) -> &ProcessId {
        &self.inner.node_id
    }

    /// Counters of every live transport, bytes included.
    pub fn transport_metrics(&self) -> Vec<(TransportKind, MetricsSnapshot)> {
        self.inner
            .router
            .transports()
            .transports()
            .iter()
            .map(|t| (t.kind(), t.metrics()))
            .collect()
    }

    /// Number of child threads still running.
    pub fn live_children(&self) -> usize {
        self.inner
            .children
            .lock()
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Start `count` children of `pid_type` (more when `names` is longer).
    ///
    /// Stops at the first child that cannot be started and returns the ids
    /// of those that were.
    pub(crate) fn spawn(
        &self,
        pid_type: &str,
        parent: &ProcessId,
        count: usize,
        names: &[String],
        setup: Option<(ProcessId, SetupRequest)>,
    ) -> Result<Vec<ProcessId>> {
        let spawner = self
            .inner
            .registry
            .spawner(pid_type)
            .ok_or_else(|| ProcessError::UnknownProcessType(pid_type.to_string()))?;

        let total = count.max(names.len());
        let mut spawned = Vec::with_capacity(total);
        for i in 0..total {
            let spec = SpawnSpec {
                runtime: self.clone(),
                parent: parent.clone(),
                name: names.get(i).cloned(),
                setup: setup.clone(),
            };
            match spawner(spec) {
                Ok((id, handle)) => {
                    debug!(child = %id, parent = %parent, "Process spawned");
                    self.inner.children.lock().push(handle);
                    spawned.push(id);
                }
                Err(e) => {
                    error!(pid_type, error = %e, "Spawn failed");
                    break;
                }
            }
        }
        Ok(spawned)
    }

    /// Stop the router and reap children, giving each until `grace` has
    /// passed to exit. Children still running then are detached.
    pub(crate) fn shutdown(&self, grace: Duration) {
        self.inner.router.stop();
        let handles = std::mem::take(&mut *self.inner.children.lock());
        let deadline = Instant::now() + grace;
        let mut detached = 0;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(REAP_INTERVAL);
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("Child thread panicked");
                }
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!(detached, "Children still running at shutdown");
        }
        info!(node = %self.inner.node_id, "Runtime stopped");
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.inner.node_id)
            .field("router", &self.inner.router.state())
            .field("registry", &self.inner.registry.types())
            .finish()
    }
}
