//! Pattern Matching
//!
//! The default matcher behind event patterns and history queries. A
//! [`Pattern`] is matched against a [`Term`], extending a [`Bindings`] map
//! with the values its free variables capture.
//!
//! Bound variables stand for values held by the process (a peer id, a
//! round number). During event triggering they are ignored, since the
//! process state they refer to may change before the handler runs; history
//! queries resolve them through a [`MatchContext`].

use crate::error::{ProcessError, Result};
use std::collections::BTreeMap;
use std::fmt;
use types::{ProcessId, Term};

/// What a pattern may ask of the process it is matched for.
pub trait MatchContext {
    fn self_id(&self) -> Option<&ProcessId>;

    /// Current value of a bound variable, `None` when unknown.
    fn bound(&self, name: &str) -> Option<Term>;
}

/// Context with no process behind it: `SelfPid` and bound variables never
/// match.
pub struct NoContext;

impl MatchContext for NoContext {
    fn self_id(&self) -> Option<&ProcessId> {
        None
    }

    fn bound(&self, _name: &str) -> Option<Term> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Matches anything, binds nothing
    Wildcard,
    Constant(Term),
    /// The id of the process doing the matching
    SelfPid,
    /// Captures the value; a variable seen twice must match the same value
    Free(String),
    /// Compared against [`MatchContext::bound`]
    Bound(String),
    Tuple(Vec<Pattern>),
    List(Vec<Pattern>),
}

impl Pattern {
    pub fn constant(value: impl Into<Term>) -> Self {
        Pattern::Constant(value.into())
    }

    pub fn free(name: impl Into<String>) -> Self {
        Pattern::Free(name.into())
    }

    pub fn bound(name: impl Into<String>) -> Self {
        Pattern::Bound(name.into())
    }

    pub fn tuple(items: impl IntoIterator<Item = Pattern>) -> Self {
        Pattern::Tuple(items.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Pattern>) -> Self {
        Pattern::List(items.into_iter().collect())
    }

    /// Tagged tuple `(tag, fields...)`, the usual shape of a message.
    pub fn message(tag: &str, fields: impl IntoIterator<Item = Pattern>) -> Self {
        Pattern::Tuple(
            std::iter::once(Pattern::constant(tag))
                .chain(fields)
                .collect(),
        )
    }

    /// Match `value`, adding captures to `bindings`.
    ///
    /// On failure `bindings` may hold partial captures; callers match on a
    /// scratch copy when they need all-or-nothing.
    pub fn matches(
        &self,
        value: &Term,
        bindings: &mut Bindings,
        ignore_bound: bool,
        ctx: &dyn MatchContext,
    ) -> bool {
        match self {
            Pattern::Wildcard => true,
            Pattern::Constant(expected) => expected == value,
            Pattern::SelfPid => match (ctx.self_id(), value) {
                (Some(me), Term::Pid(pid)) => me == pid,
                _ => false,
            },
            Pattern::Free(name) => match bindings.get(name) {
                Some(seen) => seen == value,
                None => {
                    bindings.insert(name.clone(), value.clone());
                    true
                }
            },
            Pattern::Bound(name) => {
                if ignore_bound {
                    return true;
                }
                ctx.bound(name).as_ref() == Some(value)
            }
            Pattern::Tuple(items) => match value {
                Term::Tuple(values) => {
                    Self::matches_all(items, values, bindings, ignore_bound, ctx)
                }
                _ => false,
            },
            Pattern::List(items) => match value {
                Term::List(values) => Self::matches_all(items, values, bindings, ignore_bound, ctx),
                _ => false,
            },
        }
    }

    fn matches_all(
        items: &[Pattern],
        values: &[Term],
        bindings: &mut Bindings,
        ignore_bound: bool,
        ctx: &dyn MatchContext,
    ) -> bool {
        items.len() == values.len()
            && items
                .iter()
                .zip(values)
                .all(|(p, v)| p.matches(v, bindings, ignore_bound, ctx))
    }

    /// Values of `vars`, in order, for every element of `items` this
    /// pattern matches. Bound variables are resolved, not ignored.
    pub fn filter<'a>(
        &self,
        items: impl IntoIterator<Item = &'a Term>,
        vars: &[&str],
        ctx: &dyn MatchContext,
    ) -> Vec<Vec<Term>> {
        items
            .into_iter()
            .filter_map(|item| {
                let mut bindings = Bindings::new();
                if !self.matches(item, &mut bindings, false, ctx) {
                    return None;
                }
                Some(
                    vars.iter()
                        .map(|var| bindings.get(var).cloned().unwrap_or(Term::Nil))
                        .collect(),
                )
            })
            .collect()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Pattern]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            Pattern::Wildcard => f.write_str("_"),
            Pattern::Constant(term) => write!(f, "{term}"),
            Pattern::SelfPid => f.write_str("self"),
            Pattern::Free(name) => f.write_str(name),
            Pattern::Bound(name) => write!(f, "={name}"),
            Pattern::Tuple(items) => {
                f.write_str("(")?;
                join(f, items)?;
                f.write_str(")")
            }
            Pattern::List(items) => {
                f.write_str("[")?;
                join(f, items)?;
                f.write_str("]")
            }
        }
    }
}

/// Variable captures of one successful match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings(BTreeMap<String, Term>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Term> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: String, value: Term) {
        self.0.insert(name, value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The capture `name`, or a handler error naming the missing variable.
    pub fn require(&self, name: &str) -> Result<&Term> {
        self.get(name)
            .ok_or_else(|| ProcessError::handler(name, "variable not bound by the pattern"))
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.require(name)?
            .as_int()
            .ok_or_else(|| ProcessError::handler(name, "not an integer"))
    }

    pub fn pid(&self, name: &str) -> Result<ProcessId> {
        self.require(name)?
            .as_pid()
            .cloned()
            .ok_or_else(|| ProcessError::handler(name, "not a process id"))
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| ProcessError::handler(name, "not a string"))
    }
}

impl fmt::Display for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}
