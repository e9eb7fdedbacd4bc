//! Application values carried inside messages.
//!
//! `Term` is a small dynamically-shaped value: user messages are usually
//! tuples whose first element is a string tag, e.g. `("Ping", pid, 3)`.

use crate::ProcessId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Term {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Pid(ProcessId),
    Tuple(Vec<Term>),
    List(Vec<Term>),
}

impl Term {
    pub fn tuple(items: impl IntoIterator<Item = Term>) -> Self {
        Term::Tuple(items.into_iter().collect())
    }

    pub fn list(items: impl IntoIterator<Item = Term>) -> Self {
        Term::List(items.into_iter().collect())
    }

    /// Number of elements for tuples, `None` otherwise.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Term::Tuple(items) => Some(items.len()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Term::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pid(&self) -> Option<&ProcessId> {
        match self {
            Term::Pid(p) => Some(p),
            _ => None,
        }
    }

    /// Elements of a tuple or list.
    pub fn elements(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) | Term::List(items) => Some(items),
            _ => None,
        }
    }

    /// Every process id reachable inside this value.
    pub fn pids(&self) -> Vec<ProcessId> {
        let mut out = Vec::new();
        self.collect_pids(&mut out);
        out
    }

    fn collect_pids(&self, out: &mut Vec<ProcessId>) {
        match self {
            Term::Pid(p) => out.push(p.clone()),
            Term::Tuple(items) | Term::List(items) => {
                items.iter().for_each(|t| t.collect_pids(out))
            }
            _ => {}
        }
    }
}

impl From<bool> for Term {
    fn from(v: bool) -> Self {
        Term::Bool(v)
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Term::Int(v)
    }
}

impl From<i32> for Term {
    fn from(v: i32) -> Self {
        Term::Int(v.into())
    }
}

impl From<usize> for Term {
    fn from(v: usize) -> Self {
        Term::Int(v as i64)
    }
}

impl From<&str> for Term {
    fn from(v: &str) -> Self {
        Term::Str(v.to_string())
    }
}

impl From<String> for Term {
    fn from(v: String) -> Self {
        Term::Str(v)
    }
}

impl From<ProcessId> for Term {
    fn from(v: ProcessId) -> Self {
        Term::Pid(v)
    }
}

impl From<Vec<Term>> for Term {
    fn from(v: Vec<Term>) -> Self {
        Term::List(v)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            Term::Nil => f.write_str("None"),
            Term::Bool(b) => write!(f, "{b}"),
            Term::Int(i) => write!(f, "{i}"),
            Term::Str(s) => write!(f, "{s:?}"),
            Term::Bytes(b) => write!(f, "b<{} bytes>", b.len()),
            Term::Pid(p) => write!(f, "{p}"),
            Term::Tuple(items) => {
                f.write_str("(")?;
                join(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Term::List(items) => {
                f.write_str("[")?;
                join(f, items)?;
                f.write_str("]")
            }
        }
    }
}
