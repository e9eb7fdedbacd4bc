//! Message Loop
//!
//! One background thread per runtime instance multiplexes every socket owned
//! by that instance's transports. The thread drives a current-thread tokio
//! runtime; each registration is a task that waits for its socket to become
//! readable and then calls the handler's non-blocking read callback.
//!
//! Registration and deregistration are safe from any thread. Spawning onto
//! the runtime handle wakes the loop thread through tokio's own waker, so a
//! blocked loop always observes a changed registration set.

use crate::{Result, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Socket protocol of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Identifies one socket registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopKey {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub peer: Option<SocketAddr>,
}

impl LoopKey {
    pub fn udp(local: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Udp,
            local,
            peer: None,
        }
    }

    pub fn tcp_listener(local: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Tcp,
            local,
            peer: None,
        }
    }

    pub fn tcp_connection(local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Tcp,
            local,
            peer: Some(peer),
        }
    }
}

/// What a handler wants after processing a readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Per-socket callback driven by the loop.
#[async_trait]
pub trait LoopHandler: Send + 'static {
    /// Resolve once the socket has something to read.
    async fn readable(&mut self) -> io::Result<()>;

    /// Consume what is readable without blocking.
    fn on_readable(&mut self) -> Flow;

    /// The registration ended because the handler closed or errored.
    fn on_closed(&mut self) {}
}

struct Registration {
    generation: u64,
    task: AbortHandle,
}

struct Inner {
    name: String,
    handle: Mutex<Option<Handle>>,
    registrations: Mutex<HashMap<LoopKey, Registration>>,
    generation: AtomicU64,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

/// Shared selector-style dispatcher. Cloning yields another handle to the
/// same loop.
#[derive(Clone)]
pub struct MessageLoop {
    inner: Arc<Inner>,
}

impl MessageLoop {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                handle: Mutex::new(None),
                registrations: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shutdown: Mutex::new(None),
                thread: Mutex::new(None),
                thread_id: Mutex::new(None),
            }),
        }
    }

    /// Spawn the background thread. Starting a running loop is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread_slot = self.inner.thread.lock();
        if thread_slot.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TransportError::network_with_source("failed to build loop runtime", e))?;
        let handle = runtime.handle().clone();
        let (tx, rx) = oneshot::channel::<()>();

        let name = self.inner.name.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(loop_name = %name, "message loop running");
                runtime.block_on(async {
                    let _ = rx.await;
                });
                // dropping the runtime cancels every outstanding registration
                drop(runtime);
                debug!(loop_name = %name, "message loop terminated");
            })
            .map_err(|e| TransportError::network_with_source("failed to spawn loop thread", e))?;

        *self.inner.thread_id.lock() = Some(thread.thread().id());
        *self.inner.handle.lock() = Some(handle);
        *self.inner.shutdown.lock() = Some(tx);
        *thread_slot = Some(thread);
        info!(loop_name = %self.inner.name, "message loop started");
        Ok(())
    }

    /// Stop the background thread. Safe to call repeatedly and from the loop
    /// thread itself.
    pub fn stop(&self) {
        let sender = self.inner.shutdown.lock().take();
        let Some(sender) = sender else {
            return;
        };

        for (_, registration) in self.inner.registrations.lock().drain() {
            registration.task.abort();
        }
        *self.inner.handle.lock() = None;
        let _ = sender.send(());

        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread {
            if self.on_loop_thread() {
                debug!(loop_name = %self.inner.name, "stop called on loop thread, not joining");
            } else if thread.join().is_err() {
                error!(loop_name = %self.inner.name, "message loop thread panicked");
            }
        }
        info!(loop_name = %self.inner.name, "message loop stopped");
    }

    /// True while the background thread is running.
    pub fn is_alive(&self) -> bool {
        self.inner
            .thread
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.inner.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &LoopKey) -> bool {
        self.inner.registrations.lock().contains_key(key)
    }

    /// Handle of the loop's runtime, for sockets that must be created inside
    /// its context.
    pub fn handle(&self) -> Result<Handle> {
        self.inner
            .handle
            .lock()
            .clone()
            .ok_or_else(|| TransportError::invalid_state("use message loop", "stopped"))
    }

    /// Run `future` as a task on the loop thread and wait for its output.
    ///
    /// Fails with an invalid-state error when the loop is stopped, including
    /// when it stops while the task is still pending. Must not be called from
    /// the loop thread itself.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.on_loop_thread() {
            return Err(TransportError::invalid_state(
                "block on message loop",
                "on the loop thread",
            ));
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        {
            // stop() clears the handle under this lock before shutting down
            let handle = self.inner.handle.lock();
            let Some(handle) = handle.as_ref() else {
                return Err(TransportError::invalid_state("block on message loop", "stopped"));
            };
            handle.spawn(async move {
                let _ = tx.send(future.await);
            });
        }
        rx.recv()
            .map_err(|_| TransportError::invalid_state("block on message loop", "stopped"))
    }

    fn on_loop_thread(&self) -> bool {
        Some(thread::current().id()) == *self.inner.thread_id.lock()
    }

    /// Add a readable-interest registration, replacing any existing one
    /// under the same key.
    pub fn register<H: LoopHandler>(&self, key: LoopKey, handler: H) -> Result<()> {
        let handle = self.handle()?;
        let mut registrations = self.inner.registrations.lock();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let task = handle.spawn(drive(key, generation, handler, Arc::downgrade(&self.inner)));

        if let Some(old) = registrations.insert(
            key,
            Registration {
                generation,
                task: task.abort_handle(),
            },
        ) {
            warn!(?key, "replacing existing loop registration");
            old.task.abort();
        }
        debug!(?key, generation, "registered with message loop");
        Ok(())
    }

    /// Remove a registration. Returns whether one existed.
    pub fn deregister(&self, key: &LoopKey) -> bool {
        match self.inner.registrations.lock().remove(key) {
            Some(registration) => {
                registration.task.abort();
                debug!(?key, "deregistered from message loop");
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for MessageLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageLoop")
            .field("name", &self.inner.name)
            .field("registrations", &self.len())
            .finish()
    }
}

async fn drive<H: LoopHandler>(key: LoopKey, generation: u64, mut handler: H, inner: Weak<Inner>) {
    loop {
        if let Err(e) = handler.readable().await {
            debug!(?key, error = %e, "socket no longer readable");
            break;
        }
        if handler.on_readable() == Flow::Close {
            break;
        }
    }
    handler.on_closed();

    if let Some(inner) = inner.upgrade() {
        let mut registrations = inner.registrations.lock();
        if registrations
            .get(&key)
            .is_some_and(|r| r.generation == generation)
        {
            registrations.remove(&key);
        }
    }
}
