//! # DistProc Network Infrastructure
//!
//! Everything between a process and the wire: the shared message loop, the
//! UDP and TCP transports with their authentication, the transport manager
//! and the router that decides between local delivery and forwarding.
//!
//! ## Layers
//!
//! - **[`mesgloop`]**: one background thread per runtime multiplexing every
//!   socket the transports own
//! - **[`transports`]**: `initialize -> start -> close` transports that push
//!   verified payloads into one inbound queue
//! - **[`protocol`]**: envelope codec and HMAC primitives
//! - **[`routing`]**: the [`Router`], local process table and the
//!   HELLO/ACK/PING/BYE control protocol
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use network::Router;
//! use runtime_config::RuntimeConfig;
//! use std::sync::Arc;
//!
//! let router = Arc::new(Router::new("node-a", RuntimeConfig::default())?);
//! let node = router.start()?;
//! println!("listening as {node:?}");
//! router.stop();
//! # Ok::<(), network::TransportError>(())
//! ```

pub mod error;
pub mod mesgloop;
pub mod protocol;
pub mod routing;
pub mod transports;

// Re-export commonly used types
pub use error::{Result, TransportError};
pub use mesgloop::{Flow, LoopHandler, LoopKey, MessageLoop};
pub use protocol::{decode_envelope, encode_envelope, Authenticator};
pub use routing::{Delivery, Mailbox, Router, RouterState, RouterStats};
pub use transports::{
    InboundPacket, SendOptions, TcpTransport, Transport, TransportKind, TransportManager,
    TransportOptions, TransportState, UdpTransport,
};
