//! Events and Event Patterns
//!
//! Every message a process receives or sends becomes an [`Event`]. Event
//! patterns declared by a process type are matched against each event; a
//! match records the event in the pattern's history (when requested) and
//! queues the pattern's handlers as jobs for the next label checkpoint.

use crate::error::Result;
use crate::pattern::{Bindings, MatchContext, Pattern};
use crate::process::DistProcess;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use types::{ProcessId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Received,
    Sent,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Received => "received",
            EventKind::Sent => "sent",
        })
    }
}

/// A message observed by a process, with its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Logical timestamp: the sender's clock for received messages, our own
    /// for sent ones
    pub clock: Option<u64>,
    pub source: Option<ProcessId>,
    pub destinations: Vec<ProcessId>,
    pub message: Term,
}

impl Event {
    pub fn received(
        clock: Option<u64>,
        source: Option<ProcessId>,
        dest: ProcessId,
        message: Term,
    ) -> Self {
        Self {
            kind: EventKind::Received,
            clock,
            source,
            destinations: vec![dest],
            message,
        }
    }

    pub fn sent(
        clock: Option<u64>,
        source: ProcessId,
        destinations: Vec<ProcessId>,
        message: Term,
    ) -> Self {
        Self {
            kind: EventKind::Sent,
            clock,
            source: Some(source),
            destinations,
            message,
        }
    }
}

/// Body of an event handler.
pub type HandlerFn<P> = dyn Fn(&mut DistProcess<P>, &Bindings) -> Result<()> + Send + Sync;

/// A handler attached to an event pattern, gated by label sets.
pub struct Handler<P> {
    name: String,
    labels: Option<BTreeSet<String>>,
    notlabels: Option<BTreeSet<String>>,
    body: Arc<HandlerFn<P>>,
}

impl<P> Handler<P> {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut DistProcess<P>, &Bindings) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            labels: None,
            notlabels: None,
            body: Arc::new(body),
        }
    }

    /// Run only at these labels.
    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Never run at these labels.
    pub fn notlabels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notlabels = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a job of this handler may run at label `label`.
    pub fn admits(&self, label: &str) -> bool {
        self.labels.as_ref().map_or(true, |set| set.contains(label))
            && self.notlabels.as_ref().map_or(true, |set| !set.contains(label))
    }

    pub(crate) fn body(&self) -> Arc<HandlerFn<P>> {
        Arc::clone(&self.body)
    }
}

impl<P> fmt::Debug for Handler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("labels", &self.labels)
            .field("notlabels", &self.notlabels)
            .finish()
    }
}

/// Declarative shape of the events a process reacts to.
///
/// `sources`, `destinations` and `timestamps` are any-of lists; `None`
/// accepts every value.
pub struct EventPattern<P> {
    pub name: String,
    pub kind: EventKind,
    pub message: Pattern,
    pub sources: Option<Vec<Pattern>>,
    pub destinations: Option<Vec<Pattern>>,
    pub timestamps: Option<Vec<Pattern>>,
    pub record_history: bool,
    pub handlers: Vec<Arc<Handler<P>>>,
}

impl<P> EventPattern<P> {
    pub fn new(name: impl Into<String>, kind: EventKind, message: Pattern) -> Self {
        Self {
            name: name.into(),
            kind,
            message,
            sources: None,
            destinations: None,
            timestamps: None,
            record_history: false,
            handlers: Vec::new(),
        }
    }

    pub fn received(name: impl Into<String>, message: Pattern) -> Self {
        Self::new(name, EventKind::Received, message)
    }

    pub fn sent(name: impl Into<String>, message: Pattern) -> Self {
        Self::new(name, EventKind::Sent, message)
    }

    pub fn from(mut self, source: Pattern) -> Self {
        self.sources.get_or_insert_with(Vec::new).push(source);
        self
    }

    pub fn to(mut self, destination: Pattern) -> Self {
        self.destinations.get_or_insert_with(Vec::new).push(destination);
        self
    }

    pub fn at(mut self, timestamp: Pattern) -> Self {
        self.timestamps.get_or_insert_with(Vec::new).push(timestamp);
        self
    }

    /// Keep every matching event in the process's history.
    pub fn history(mut self) -> Self {
        self.record_history = true;
        self
    }

    pub fn handler(mut self, handler: Handler<P>) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Match `event`, returning the captures on success.
    pub fn matches(
        &self,
        event: &Event,
        ignore_bound: bool,
        ctx: &dyn MatchContext,
    ) -> Option<Bindings> {
        if event.kind != self.kind {
            return None;
        }
        let mut bindings = Bindings::new();
        if !self.message.matches(&event.message, &mut bindings, ignore_bound, ctx) {
            return None;
        }

        let source = event.source.clone().map(Term::Pid).unwrap_or(Term::Nil);
        let clock = event.clock.map(|c| Term::Int(c as i64)).unwrap_or(Term::Nil);
        let destinations: Vec<Term> = event.destinations.iter().cloned().map(Term::Pid).collect();

        let bindings = any_of(self.sources.as_deref(), &[source], bindings, ignore_bound, ctx)?;
        let bindings = any_of(
            self.destinations.as_deref(),
            &destinations,
            bindings,
            ignore_bound,
            ctx,
        )?;
        any_of(self.timestamps.as_deref(), &[clock], bindings, ignore_bound, ctx)
    }
}

/// First pattern/value pair that matches wins; its captures are kept.
fn any_of(
    patterns: Option<&[Pattern]>,
    values: &[Term],
    bindings: Bindings,
    ignore_bound: bool,
    ctx: &dyn MatchContext,
) -> Option<Bindings> {
    let Some(patterns) = patterns else {
        return Some(bindings);
    };
    patterns.iter().find_map(|pattern| {
        values.iter().find_map(|value| {
            let mut scratch = bindings.clone();
            pattern
                .matches(value, &mut scratch, ignore_bound, ctx)
                .then_some(scratch)
        })
    })
}

impl<P> Clone for EventPattern<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            message: self.message.clone(),
            sources: self.sources.clone(),
            destinations: self.destinations.clone(),
            timestamps: self.timestamps.clone(),
            record_history: self.record_history,
            handlers: self.handlers.clone(),
        }
    }
}

impl<P> fmt::Debug for EventPattern<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPattern")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("message", &format_args!("{}", self.message))
            .field("record_history", &self.record_history)
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// A handler queued with the captures of the event that triggered it.
pub(crate) struct Job<P> {
    pub handler: Arc<Handler<P>>,
    pub bindings: Bindings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::NoContext;

    struct Unit;

    fn pid(uid: u64) -> ProcessId {
        ProcessId::with_uid(uid, "P", None, "h", vec![Some(1)])
    }

    #[test]
    fn label_sets_gate_handlers() {
        let open: Handler<Unit> = Handler::new("open", |_, _| Ok(()));
        assert!(open.admits("anything"));

        let only: Handler<Unit> = Handler::new("only", |_, _| Ok(())).labels(["a"]);
        assert!(only.admits("a"));
        assert!(!only.admits("b"));

        let never: Handler<Unit> = Handler::new("never", |_, _| Ok(()))
            .labels(["a", "b"])
            .notlabels(["b"]);
        assert!(never.admits("a"));
        assert!(!never.admits("b"));
    }

    #[test]
    fn source_and_timestamp_constraints() {
        let pattern: EventPattern<Unit> =
            EventPattern::received("ping", Pattern::message("Ping", [Pattern::free("n")]))
                .from(Pattern::constant(pid(2)))
                .from(Pattern::free("sender"))
                .at(Pattern::free("ts"));
        let message = Term::tuple([Term::from("Ping"), Term::Int(1)]);
        let event = Event::received(Some(9), Some(pid(3)), pid(1), message);

        let bindings = pattern.matches(&event, true, &NoContext).unwrap();
        assert_eq!(bindings.pid("sender").unwrap(), pid(3));
        assert_eq!(bindings.int("ts").unwrap(), 9);
        assert_eq!(bindings.int("n").unwrap(), 1);
    }

    #[test]
    fn kind_must_agree() {
        let pattern: EventPattern<Unit> = EventPattern::sent("out", Pattern::Wildcard);
        let event = Event::received(None, None, pid(1), Term::Nil);
        assert!(pattern.matches(&event, true, &NoContext).is_none());
        let event = Event::sent(None, pid(1), vec![pid(2)], Term::Nil);
        assert!(pattern.matches(&event, true, &NoContext).is_some());
    }

    #[test]
    fn destination_alternatives_are_tried_in_order() {
        let pattern: EventPattern<Unit> = EventPattern::received("m", Pattern::free("x"))
            .to(Pattern::constant(pid(5)))
            .to(Pattern::free("d"));
        let event = Event::received(None, None, pid(1), Term::Int(1));
        let bindings = pattern.matches(&event, true, &NoContext).unwrap();
        assert_eq!(bindings.pid("d").unwrap(), pid(1));
        assert_eq!(bindings.len(), 2);
    }
}
