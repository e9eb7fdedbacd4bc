//! Transport Error Types
//!
//! Error taxonomy for binding, authenticating, framing, routing and
//! bootstrapping. Receive-side authentication and version failures are
//! logged and dropped by the transports; every other variant reaches the
//! caller of the failing operation.

use std::net::SocketAddr;
use thiserror::Error;
use types::ChannelCaps;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// No port could be bound within the retry budget
    #[error("Binding error: {message} after {attempts} attempt(s)")]
    Binding {
        message: String,
        attempts: u32,
        source: Option<std::io::Error>,
    },

    /// Digest or handshake mismatch
    #[error("Authentication error: {message} (remote: {remote_addr:?})")]
    Authentication {
        message: String,
        remote_addr: Option<SocketAddr>,
    },

    /// Peer speaks another protocol version
    #[error("Version mismatch: expected {expected:?}, received {received:?}")]
    VersionMismatch { expected: Vec<u8>, received: Vec<u8> },

    /// Payload larger than the transport accepts
    #[error("Packet size {size} exceeds limit {limit}")]
    PacketSizeExceeded { size: usize, limit: usize },

    /// No transport satisfies the requested channel capabilities
    #[error("No available transport for channel {caps:?}")]
    NoAvailableTransport { caps: ChannelCaps },

    /// The destination exposes no address on the selected transport
    #[error("No target transport: {dest} has no address on slot {slot}")]
    NoTargetTransport { dest: String, slot: usize },

    /// The destination's addresses are this router's own
    #[error("Circular routing: {dest} resolves to this router")]
    CircularRouting { dest: String },

    /// No peer answered the discovery handshake
    #[error("Bootstrap failed for {host}:{port}: {message}")]
    Bootstrap {
        host: String,
        port: u16,
        message: String,
    },

    /// Operation called out of lifecycle order
    #[error("Invalid transport state: cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    /// Network connectivity errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The peer closed a cached connection
    #[error("Connection closed (remote: {remote_addr:?})")]
    ConnectionClosed { remote_addr: Option<SocketAddr> },

    /// Protocol and serialization errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Transport timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A transient failure outlived the retry budget
    #[error("Retries exhausted: {operation} failed {attempts} time(s): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a binding error
    pub fn binding(
        message: impl Into<String>,
        attempts: u32,
        source: Option<std::io::Error>,
    ) -> Self {
        Self::Binding {
            message: message.into(),
            attempts,
            source,
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Authentication {
            message: message.into(),
            remote_addr,
        }
    }

    pub fn version_mismatch(expected: &[u8], received: &[u8]) -> Self {
        Self::VersionMismatch {
            expected: expected.to_vec(),
            received: received.to_vec(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Create a bootstrap error
    pub fn bootstrap(host: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Self::Bootstrap {
            host: host.into(),
            port,
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error with source
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Check if a send that failed with this error may be attempted again
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network { .. }
            | TransportError::Connection { .. }
            | TransportError::ConnectionClosed { .. }
            | TransportError::Timeout { .. } => true,
            TransportError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// True for connection-refused failures, which are only retried on request
    pub fn is_refused(&self) -> bool {
        let io = match self {
            TransportError::Io { source, .. } => Some(source),
            TransportError::Connection {
                source: Some(source),
                ..
            } => source.downcast_ref::<std::io::Error>(),
            _ => None,
        };
        io.is_some_and(|e| e.kind() == std::io::ErrorKind::ConnectionRefused)
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Binding { .. } => "binding",
            TransportError::Authentication { .. } => "authentication",
            TransportError::VersionMismatch { .. } => "version",
            TransportError::PacketSizeExceeded { .. } => "packet_size",
            TransportError::NoAvailableTransport { .. } => "no_transport",
            TransportError::NoTargetTransport { .. } => "no_target",
            TransportError::CircularRouting { .. } => "circular_routing",
            TransportError::Bootstrap { .. } => "bootstrap",
            TransportError::InvalidState { .. } => "invalid_state",
            TransportError::Network { .. } => "network",
            TransportError::Connection { .. } => "connection",
            TransportError::ConnectionClosed { .. } => "connection_closed",
            TransportError::Protocol { .. } => "protocol",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Timeout { .. } => "timeout",
            TransportError::RetriesExhausted { .. } => "retries_exhausted",
            TransportError::Io { .. } => "io",
        }
    }
}

/// Convert std::io::Error to TransportError
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Convert bincode errors to transport errors
impl From<bincode::Error> for TransportError {
    fn from(error: bincode::Error) -> Self {
        TransportError::protocol_with_source("Binary serialization failed", error)
    }
}
