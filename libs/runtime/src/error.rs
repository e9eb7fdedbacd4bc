//! Process Error Types
//!
//! Failures surfaced to process code. Transport failures pass through
//! unchanged; `Terminated` is the signal that unwinds a process's main
//! call stack when it is asked to end.

use network::TransportError;
use thiserror::Error;

/// Main process error type
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An async command was not fully acknowledged in time
    #[error("Timeout: {operation} not acknowledged within {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The process was asked to end, or crashed at a label
    #[error("Process terminated with code {code}")]
    Terminated { code: i32 },

    #[error("Unknown process type: {0}")]
    UnknownProcessType(String),

    /// A handler body failed
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Spawn failed: {message}")]
    Spawn {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProcessError {
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    pub fn spawn(message: impl Into<String>, source: Option<std::io::Error>) -> Self {
        Self::Spawn {
            message: message.into(),
            source,
        }
    }

    /// True for the end-of-process signal, which must never be swallowed.
    pub fn is_termination(&self) -> bool {
        matches!(self, ProcessError::Terminated { .. })
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
