//! Distributed Processes
//!
//! A [`DistProcess`] is the runtime half of one process: its mailbox, the
//! fixed command dispatch table, the correlation table for async commands,
//! the logical clock, and the deferred job queue drained at labels. The user
//! half is a [`ProcessType`], whose state lives in [`DistProcess::state`].
//!
//! ## Execution model
//!
//! Only the thread owning a `DistProcess` runs its code. Inbound commands
//! are dispatched whenever that thread waits (at a label, in an async
//! command, or while idle). Messages are not handled on arrival: they queue
//! up and each label checkpoint turns at most one of them (all queued ones in
//! handle-all mode) into a received event, then runs the handlers that event
//! queued and that the label admits.
//!
//! ## Lifecycle of a child process
//!
//! ```text
//! spawned -> Setup/SetupAck -> Start/StartAck -> run() -> ... -> End/EndAck
//! ```
//!
//! `End` arrives as [`ProcessError::Terminated`] out of whatever wait the
//! process is in, unwinding `run()` through `?`.

use crate::correlation::{next_seqno, AckResults, CorrelationTable};
use crate::error::{ProcessError, Result};
use crate::events::{Event, EventPattern, Job};
use crate::pattern::{MatchContext, Pattern};
use crate::registry::{Spawn, SpawnSpec};
use crate::runtime::Runtime;
use crate::stats::{ProcessStats, StatsSnapshot};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use network::Delivery;
use runtime_config::defaults::process::CRASH_EXIT_CODE;
use runtime_config::{ClockKind, FailureRates, RuntimeConfig};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span, trace, warn};
use types::{ChannelCaps, Command, CommandKind, ProcessId, SetupRequest, Term};

/// Handler for one command kind.
pub type CommandFn<P> = fn(&mut DistProcess<P>, Option<ProcessId>, Command) -> Result<()>;

/// The user-supplied half of a process.
pub trait ProcessType: Default + Send + Sized + 'static {
    /// Name children of this type are spawned by.
    const TYPE_NAME: &'static str;

    /// Event patterns, matched in order against every event.
    fn events() -> Vec<EventPattern<Self>> {
        Vec::new()
    }

    /// Extra or replacement command handlers.
    fn commands() -> Vec<(CommandKind, CommandFn<Self>)> {
        Vec::new()
    }

    fn setup(_process: &mut DistProcess<Self>, _args: Vec<Term>) -> Result<()> {
        Ok(())
    }

    fn run(process: &mut DistProcess<Self>) -> Result<()>;

    /// Value of a bound pattern variable, read from process state.
    fn bound(&self, _name: &str) -> Option<Term> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    SetUp,
    Running,
    /// `run()` returned; waiting for `End`
    Done,
}

#[derive(Debug, Clone)]
pub(crate) struct ProcessOptions {
    handle_all: bool,
    failures: FailureRates,
    clock: Option<ClockKind>,
    command_timeout: Option<Duration>,
    caps: ChannelCaps,
}

impl ProcessOptions {
    pub(crate) fn new(config: &RuntimeConfig, caps: ChannelCaps) -> Self {
        Self {
            handle_all: config.handle_all,
            failures: config.failures,
            clock: config.clock,
            command_timeout: config.command_timeout(),
            caps,
        }
    }
}

pub struct DistProcess<P> {
    /// User state
    pub state: P,
    id: ProcessId,
    parent: Option<ProcessId>,
    runtime: Runtime,
    mailbox: Receiver<Delivery>,
    /// Messages received but not yet turned into events
    backlog: VecDeque<Delivery>,
    commands: [Option<CommandFn<P>>; CommandKind::COUNT],
    events: Arc<Vec<EventPattern<P>>>,
    histories: HashMap<String, Vec<Event>>,
    jobs: VecDeque<Job<P>>,
    correlation: CorrelationTable,
    clock: Option<u64>,
    options: ProcessOptions,
    phase: Phase,
    /// `End` request being honoured: requester, seqno, exit code
    ending: Option<(Option<ProcessId>, u64, i32)>,
    timer: Option<Instant>,
    timer_expired: bool,
    stats: ProcessStats,
}

impl<P: ProcessType> DistProcess<P> {
    pub(crate) fn new(
        runtime: Runtime,
        id: ProcessId,
        parent: Option<ProcessId>,
        mailbox: Receiver<Delivery>,
        phase: Phase,
    ) -> Self {
        let mut commands: [Option<CommandFn<P>>; CommandKind::COUNT] = [None; CommandKind::COUNT];
        commands[CommandKind::Message.index()] = Some(Self::on_message);
        commands[CommandKind::Setup.index()] = Some(Self::on_setup);
        commands[CommandKind::Start.index()] = Some(Self::on_start);
        commands[CommandKind::End.index()] = Some(Self::on_end);
        commands[CommandKind::Resolve.index()] = Some(Self::on_resolve);
        for kind in CommandKind::ALL.into_iter().filter(|k| k.is_ack()) {
            commands[kind.index()] = Some(Self::on_ack);
        }
        for (kind, handler) in P::commands() {
            commands[kind.index()] = Some(handler);
        }

        let options = ProcessOptions::new(runtime.config(), runtime.router().default_caps());
        let clock = match options.clock {
            Some(ClockKind::Lamport) => Some(0),
            None => None,
        };

        Self {
            state: P::default(),
            id,
            parent,
            runtime,
            mailbox,
            backlog: VecDeque::new(),
            commands,
            events: Arc::new(P::events()),
            histories: HashMap::new(),
            jobs: VecDeque::new(),
            correlation: CorrelationTable::new(),
            clock,
            options,
            phase,
            ending: None,
            timer: None,
            timer_expired: false,
            stats: ProcessStats::default(),
        }
    }

    /// Register a new child with the router and start its thread.
    ///
    /// The child is reachable as soon as this returns; it sets itself up
    /// right away when `setup` is given, otherwise it waits for `Setup`.
    pub(crate) fn spawn(spec: SpawnSpec) -> Result<(ProcessId, JoinHandle<()>)> {
        let SpawnSpec {
            runtime,
            parent,
            name,
            setup,
        } = spec;
        let router = Arc::clone(runtime.router());
        let id = router.new_process_id(P::TYPE_NAME, name);
        let (tx, rx) = crossbeam_channel::unbounded();
        router.register_local_process(id.clone(), tx);

        let process = Self::new(runtime, id.clone(), Some(parent), rx, Phase::Created);
        let spawned = thread::Builder::new()
            .name(id.to_string())
            .spawn(move || process.run_child(setup));
        match spawned {
            Ok(handle) => Ok((id, handle)),
            Err(e) => {
                router.deregister_local_process(&id);
                Err(ProcessError::spawn(format!("no thread for {id}"), Some(e)))
            }
        }
    }

    fn run_child(mut self, setup: Option<(ProcessId, SetupRequest)>) {
        let span = info_span!("process", id = %self.id);
        let _enter = span.enter();

        let outcome = match self.child_main(setup) {
            Err(e) if !e.is_termination() => {
                error!(error = %e, "Process failed");
                self.phase = Phase::Done;
                self.serve_until_end()
            }
            other => other,
        };
        match outcome {
            Err(ProcessError::Terminated { code }) => debug!(code, "Process terminated"),
            Err(e) => error!(error = %e, "Process stopped"),
            Ok(()) => debug!("Process stopped"),
        }
        self.finish();
    }

    fn child_main(&mut self, setup: Option<(ProcessId, SetupRequest)>) -> Result<()> {
        match setup {
            Some((requester, request)) => {
                self.perform_setup(request.args)?;
                self.send_command(&requester, Command::SetupAck { seqno: request.seqno })?;
            }
            None => self.serve_until(Phase::SetUp)?,
        }
        self.serve_until(Phase::Running)?;
        P::run(self)?;
        self.phase = Phase::Done;
        self.serve_until_end()
    }

    fn perform_setup(&mut self, args: Vec<Term>) -> Result<()> {
        P::setup(self, args).map_err(|e| match e {
            ProcessError::Terminated { .. } | ProcessError::Setup(_) => e,
            other => ProcessError::Setup(other.to_string()),
        })?;
        self.phase = Phase::SetUp;
        Ok(())
    }

    /// Dispatch commands until the process reaches `phase`.
    fn serve_until(&mut self, phase: Phase) -> Result<()> {
        while self.phase < phase {
            if let Some(delivery) = self.next_delivery(None)? {
                self.dispatch(delivery)?;
            }
        }
        Ok(())
    }

    /// Answer commands until `End` arrives.
    fn serve_until_end(&mut self) -> Result<()> {
        loop {
            if let Some(delivery) = self.next_delivery(None)? {
                self.dispatch(delivery)?;
            }
        }
    }

    /// Acknowledge a pending `End`. Leaving the router happens on drop.
    fn finish(&mut self) {
        if let Some((Some(requester), seqno, code)) = self.ending.take() {
            if let Err(e) = self.send_command(&requester, Command::EndAck { seqno, code }) {
                warn!(requester = %requester, error = %e, "Failed to acknowledge End");
            }
        }
        debug!(stats = ?self.stats.snapshot(), "Process exiting");
    }

    pub fn id(&self) -> &ProcessId {
        &self.id
    }

    pub fn parent(&self) -> Option<&ProcessId> {
        self.parent.as_ref()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current Lamport time, when the process keeps one.
    pub fn logical_clock(&self) -> Option<u64> {
        self.clock
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Events recorded for the pattern named `pattern`.
    pub fn history(&self, pattern: &str) -> &[Event] {
        self.histories
            .get(pattern)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Project the messages recorded for `pattern` through `query`.
    pub fn query_history(&self, pattern: &str, query: &Pattern, vars: &[&str]) -> Vec<Vec<Term>> {
        query.filter(self.history(pattern).iter().map(|e| &e.message), vars, self)
    }

    /// Add an event pattern after construction. It sees events from now on.
    pub fn add_event(&mut self, pattern: EventPattern<P>) {
        Arc::make_mut(&mut self.events).push(pattern);
    }

    /// Jobs waiting for a label that admits them.
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Messages received but not yet processed by a label.
    pub fn pending_messages(&self) -> usize {
        self.backlog.len() + self.mailbox.len()
    }

    /// Bound on async-command waits; `None` waits indefinitely.
    pub fn command_timeout(&self) -> Option<Duration> {
        self.options.command_timeout
    }

    pub fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        self.options.command_timeout = timeout;
    }

    pub fn timer_expired(&self) -> bool {
        self.timer_expired
    }

    pub fn reset_timer(&mut self) {
        self.timer = None;
        self.timer_expired = false;
    }

    // ---- Messaging ----

    pub fn send(&mut self, message: impl Into<Term>, to: &ProcessId) -> Result<()> {
        let caps = self.options.caps;
        self.send_with(message, std::slice::from_ref(to), caps)
    }

    pub fn send_to(&mut self, message: impl Into<Term>, to: &[ProcessId]) -> Result<()> {
        let caps = self.options.caps;
        self.send_with(message, to, caps)
    }

    /// Send `message` to every process in `to` over a channel with `caps`.
    ///
    /// All destinations are attempted; the first failure is returned after
    /// the sent event has been triggered.
    pub fn send_with(
        &mut self,
        message: impl Into<Term>,
        to: &[ProcessId],
        caps: ChannelCaps,
    ) -> Result<()> {
        let message = message.into();
        if let Some(clock) = self.clock.as_mut() {
            *clock += 1;
        }

        let mut first_error = None;
        if self.fails(self.options.failures.send) {
            warn!(to = ?to, "Simulated send failure; message dropped");
            self.stats.dropped();
        } else {
            let router = Arc::clone(self.runtime.router());
            for dest in to {
                let command = Command::Message {
                    clock: self.clock,
                    body: message.clone(),
                };
                if let Err(e) = router.send(Some(&self.id), Some(dest), command.into(), caps) {
                    warn!(dest = %dest, error = %e, "Send failed");
                    first_error.get_or_insert(e);
                }
            }
            self.stats.sent(to.len());
        }

        let event = Event::sent(self.clock, self.id.clone(), to.to_vec(), message);
        self.trigger_event(&event);
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    pub(crate) fn send_command(&self, dest: &ProcessId, command: Command) -> Result<()> {
        self.runtime
            .router()
            .send(Some(&self.id), Some(dest), command.into(), ChannelCaps::RELIABLE_FIFO)?;
        Ok(())
    }

    fn fails(&self, rate: f64) -> bool {
        rate > 0.0 && rand::random::<f64>() < rate
    }

    // ---- Labels ----

    /// Label checkpoint.
    ///
    /// Processes one pending message (every queued one in handle-all mode),
    /// waiting for one when `block` is set, then runs the queued handler
    /// jobs that `name` admits. The others stay queued in order.
    ///
    /// With a `timeout`, a timer starts at the first such call and persists
    /// across calls; once it has run out the label returns without doing
    /// anything and [`timer_expired`](Self::timer_expired) is set.
    pub fn label(&mut self, name: &str, block: bool, timeout: Option<Duration>) -> Result<()> {
        match name {
            "start" => self.stats.start_timer(),
            "end" => self.stats.stop_timer(),
            _ => {}
        }
        if self.fails(self.options.failures.crash) {
            warn!(label = name, "Simulated crash");
            return Err(ProcessError::Terminated {
                code: CRASH_EXIT_CODE,
            });
        }

        let mut wait = None;
        if let Some(timeout) = timeout {
            let elapsed = self.timer.get_or_insert_with(Instant::now).elapsed();
            if elapsed >= timeout {
                self.timer = None;
                self.timer_expired = true;
                return Ok(());
            }
            wait = Some(timeout - elapsed);
        }

        self.process_event(block, wait)?;
        self.process_jobqueue(name)
    }

    /// Run labels named `label` until `condition` holds. Returns `false`
    /// when `timeout` ran out first.
    pub fn await_until<F>(
        &mut self,
        mut condition: F,
        label: &str,
        timeout: Option<Duration>,
    ) -> Result<bool>
    where
        F: FnMut(&Self) -> bool,
    {
        self.reset_timer();
        loop {
            if condition(self) {
                self.reset_timer();
                return Ok(true);
            }
            self.label(label, true, timeout)?;
            if self.timer_expired {
                self.reset_timer();
                return Ok(false);
            }
        }
    }

    fn process_event(&mut self, block: bool, timeout: Option<Duration>) -> Result<()> {
        while let Ok(delivery) = self.mailbox.try_recv() {
            self.dispatch(delivery)?;
        }

        let budget = if self.options.handle_all {
            self.backlog.len().max(1)
        } else {
            1
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut handled = 0;

        while handled < budget {
            if let Some(delivery) = self.backlog.pop_front() {
                self.receive(delivery);
                handled += 1;
                continue;
            }
            if !block || handled > 0 {
                break;
            }
            let wait = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => break,
                },
                None => None,
            };
            match self.next_delivery(wait)? {
                Some(delivery) => {
                    self.dispatch(delivery)?;
                    // a command rather than a message: let the caller re-check
                    if self.backlog.is_empty() {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    fn receive(&mut self, delivery: Delivery) {
        let Command::Message { clock, body } = delivery.command else {
            return;
        };
        if self.fails(self.options.failures.receive) {
            warn!(src = ?delivery.src, "Simulated receive failure; message dropped");
            self.stats.dropped();
            return;
        }
        if let Some(own) = self.clock.as_mut() {
            *own = (*own).max(clock.unwrap_or(0)) + 1;
        }
        self.stats.received();
        let event = Event::received(clock, delivery.src, self.id.clone(), body);
        self.trigger_event(&event);
    }

    fn trigger_event(&mut self, event: &Event) {
        let patterns = Arc::clone(&self.events);
        for pattern in patterns.iter() {
            let Some(bindings) = pattern.matches(event, true, &*self) else {
                continue;
            };
            trace!(pattern = %pattern.name, %bindings, "Event matched");
            if pattern.record_history {
                self.histories
                    .entry(pattern.name.clone())
                    .or_default()
                    .push(event.clone());
            }
            for handler in &pattern.handlers {
                self.jobs.push_back(Job {
                    handler: Arc::clone(handler),
                    bindings: bindings.clone(),
                });
            }
        }
    }

    fn process_jobqueue(&mut self, label: &str) -> Result<()> {
        let mut deferred = VecDeque::new();
        while let Some(job) = self.jobs.pop_front() {
            if !job.handler.admits(label) {
                deferred.push_back(job);
                continue;
            }
            if let Err(e) = self.run_handler(job) {
                deferred.extend(self.jobs.drain(..));
                self.jobs = deferred;
                return Err(e);
            }
        }
        self.jobs = deferred;
        Ok(())
    }

    /// Run one job. Only the termination signal escapes; other failures
    /// and panics are logged.
    fn run_handler(&mut self, job: Job<P>) -> Result<()> {
        let body = job.handler.body();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self, &job.bindings)));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_termination() => Err(e),
            Ok(Err(e)) => {
                self.stats.handler_failed();
                error!(
                    handler = job.handler.name(),
                    bindings = %job.bindings,
                    error = %e,
                    "Handler failed"
                );
                Ok(())
            }
            Err(payload) => {
                self.stats.handler_failed();
                error!(
                    handler = job.handler.name(),
                    bindings = %job.bindings,
                    panic = %panic_message(payload.as_ref()),
                    "Handler panicked"
                );
                Ok(())
            }
        }
    }

    // ---- Command dispatch ----

    fn next_delivery(&mut self, wait: Option<Duration>) -> Result<Option<Delivery>> {
        let received = match wait {
            Some(wait) => self.mailbox.recv_timeout(wait),
            None => self
                .mailbox
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(delivery) => Ok(Some(delivery)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Mailbox closed; process deregistered");
                Err(ProcessError::Terminated { code: 0 })
            }
        }
    }

    fn dispatch(&mut self, delivery: Delivery) -> Result<()> {
        let kind = delivery.command.kind();
        let handler = self.commands[kind.index()];
        match handler {
            Some(handler) => handler(self, delivery.src, delivery.command),
            None => {
                warn!(%kind, src = ?delivery.src, "No handler for command; dropped");
                Ok(())
            }
        }
    }

    fn on_message(&mut self, src: Option<ProcessId>, command: Command) -> Result<()> {
        if self.phase == Phase::Done {
            trace!(src = ?src, "Message after run() returned; dropped");
            return Ok(());
        }
        self.backlog.push_back(Delivery { src, command });
        Ok(())
    }

    pub(crate) fn on_ack(&mut self, src: Option<ProcessId>, command: Command) -> Result<()> {
        let Some((request, seqno, result)) = command.ack() else {
            return Ok(());
        };
        let Some(src) = src else {
            warn!(kind = %command.kind(), seqno, "Ack without source dropped");
            return Ok(());
        };
        self.stats.ack(command.kind());
        self.correlation.record_ack(request, seqno, src, result);
        Ok(())
    }

    fn on_setup(&mut self, src: Option<ProcessId>, command: Command) -> Result<()> {
        let Command::Setup { seqno, args } = command else {
            return Ok(());
        };
        if self.phase == Phase::Created {
            self.perform_setup(args)?;
        } else {
            warn!(phase = ?self.phase, "Setup repeated; ignored");
        }
        match src {
            Some(src) => self.send_command(&src, Command::SetupAck { seqno }),
            None => Ok(()),
        }
    }

    fn on_start(&mut self, src: Option<ProcessId>, command: Command) -> Result<()> {
        let Command::Start { seqno } = command else {
            return Ok(());
        };
        if self.phase == Phase::Created {
            warn!("Start before Setup; ignored");
            return Ok(());
        }
        if self.phase == Phase::SetUp {
            self.phase = Phase::Running;
        }
        match src {
            Some(src) => self.send_command(&src, Command::StartAck { seqno }),
            None => Ok(()),
        }
    }

    fn on_end(&mut self, src: Option<ProcessId>, command: Command) -> Result<()> {
        let Command::End { seqno, code } = command else {
            return Ok(());
        };
        debug!(code, requester = ?src, "End requested");
        self.ending = Some((src, seqno, code));
        Err(ProcessError::Terminated { code })
    }

    fn on_resolve(&mut self, src: Option<ProcessId>, command: Command) -> Result<()> {
        let Command::Resolve { seqno, name } = command else {
            return Ok(());
        };
        let id = self.runtime.router().resolve_name(&name);
        match src {
            Some(src) => self.send_command(&src, Command::ResolveAck { seqno, id }),
            None => Ok(()),
        }
    }

    // ---- Async commands ----

    /// Send one request per target and wait until every target answered.
    pub(crate) fn request<F>(
        &mut self,
        kind: CommandKind,
        targets: &[ProcessId],
        make: F,
    ) -> Result<AckResults>
    where
        F: Fn(u64) -> Command,
    {
        let seqno = next_seqno();
        self.correlation.register(kind, seqno);
        for target in targets {
            if let Err(e) = self.send_command(target, make(seqno)) {
                self.correlation.cancel(kind, seqno);
                return Err(e);
            }
        }
        self.correlation.set_participants(kind, seqno, targets.iter().cloned());
        self.wait_for(kind, seqno)
    }

    /// Dispatch commands until the entry completes or the command timeout
    /// runs out. Messages arriving meanwhile are kept for later labels.
    fn wait_for(&mut self, kind: CommandKind, seqno: u64) -> Result<AckResults> {
        let timeout = self.options.command_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(results) = self.correlation.take_results(kind, seqno) {
                return Ok(results);
            }
            let wait = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    match deadline.checked_duration_since(Instant::now()) {
                        Some(left) if !left.is_zero() => Some(left),
                        _ => {
                            let missing = self.correlation.outstanding(kind, seqno);
                            self.correlation.cancel(kind, seqno);
                            warn!(%kind, seqno, ?missing, "Command not acknowledged in time");
                            return Err(ProcessError::timeout(
                                kind.to_string(),
                                timeout.as_millis() as u64,
                            ));
                        }
                    }
                }
                _ => None,
            };
            let outcome = match self.next_delivery(wait) {
                Ok(Some(delivery)) => self.dispatch(delivery),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                self.correlation.cancel(kind, seqno);
                return Err(e);
            }
        }
    }

    fn spawn_target(&self, spawn: &Spawn) -> ProcessId {
        spawn
            .at
            .clone()
            .unwrap_or_else(|| self.runtime.node_id().clone())
    }

    /// Ask a node to spawn processes; returns their ids.
    pub fn new_processes(&mut self, spawn: &Spawn) -> Result<Vec<ProcessId>> {
        let node = self.spawn_target(spawn);
        let results = self.request(CommandKind::New, std::slice::from_ref(&node), |seqno| {
            spawn.to_command(seqno, None)
        })?;
        spawned_ids(spawn, &node, results)
    }

    /// Spawn processes that set themselves up with `args` straight away,
    /// then wait for every one of them to acknowledge the setup.
    ///
    /// Setup acks may arrive before the spawn reply names the children;
    /// the correlation entry keeps them until the set is known.
    pub fn new_processes_with_setup(
        &mut self,
        spawn: &Spawn,
        args: Vec<Term>,
    ) -> Result<Vec<ProcessId>> {
        let node = self.spawn_target(spawn);
        let setup_seqno = next_seqno();
        self.correlation.register(CommandKind::Setup, setup_seqno);

        let setup = SetupRequest {
            seqno: setup_seqno,
            args,
        };
        let spawned = self
            .request(CommandKind::New, std::slice::from_ref(&node), |seqno| {
                spawn.to_command(seqno, Some(setup.clone()))
            })
            .and_then(|results| spawned_ids(spawn, &node, results));
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.correlation.cancel(CommandKind::Setup, setup_seqno);
                return Err(e);
            }
        };

        self.correlation
            .set_participants(CommandKind::Setup, setup_seqno, spawned.iter().cloned());
        self.wait_for(CommandKind::Setup, setup_seqno)?;
        Ok(spawned)
    }

    pub fn setup(&mut self, targets: &[ProcessId], args: Vec<Term>) -> Result<()> {
        self.request(CommandKind::Setup, targets, |seqno| Command::Setup {
            seqno,
            args: args.clone(),
        })?;
        Ok(())
    }

    pub fn start(&mut self, targets: &[ProcessId]) -> Result<()> {
        self.request(CommandKind::Start, targets, |seqno| Command::Start { seqno })?;
        Ok(())
    }

    /// End `targets` with exit `code`; returns the codes they reported.
    pub fn end(&mut self, targets: &[ProcessId], code: i32) -> Result<Vec<(ProcessId, i32)>> {
        let results =
            self.request(CommandKind::End, targets, |seqno| Command::End { seqno, code })?;
        Ok(results
            .into_iter()
            .map(|(id, term)| {
                let code = term.as_int().and_then(|c| i32::try_from(c).ok()).unwrap_or(code);
                (id, code)
            })
            .collect())
    }

    /// Look a process up by name: in the local name table first, then by
    /// asking each peer node in turn.
    pub fn resolve(&mut self, name: &str) -> Result<Option<ProcessId>> {
        if let Some(id) = self.runtime.router().resolve_name(name) {
            return Ok(Some(id));
        }
        let peers = self.runtime.router().peers();
        for peer in peers {
            let results = self.request(CommandKind::Resolve, std::slice::from_ref(&peer), |seqno| {
                Command::Resolve {
                    seqno,
                    name: name.to_string(),
                }
            })?;
            if let Some(id) = results.into_iter().find_map(|(_, term)| term.as_pid().cloned()) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}

impl<P> Drop for DistProcess<P> {
    fn drop(&mut self) {
        self.runtime.router().deregister_local_process(&self.id);
    }
}

impl<P: ProcessType> MatchContext for DistProcess<P> {
    fn self_id(&self) -> Option<&ProcessId> {
        Some(&self.id)
    }

    fn bound(&self, name: &str) -> Option<Term> {
        self.state.bound(name)
    }
}

fn spawned_ids(spawn: &Spawn, node: &ProcessId, results: AckResults) -> Result<Vec<ProcessId>> {
    let spawned: Vec<ProcessId> = results
        .into_iter()
        .flat_map(|(_, term)| term.pids())
        .collect();
    if spawned.len() < spawn.total() {
        return Err(ProcessError::spawn(
            format!(
                "{node} spawned {} of {} {} process(es)",
                spawned.len(),
                spawn.total(),
                spawn.pid_type
            ),
            None,
        ));
    }
    Ok(spawned)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");
        let payload = panic::catch_unwind(|| std::panic::panic_any(5u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Created < Phase::SetUp);
        assert!(Phase::SetUp < Phase::Running);
        assert!(Phase::Running < Phase::Done);
    }
}
