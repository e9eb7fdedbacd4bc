//! # DistProc Shared Types
//!
//! Value types shared by every layer of the distributed-process runtime:
//! process identifiers, channel capability sets, the application value type
//! carried in messages, and the envelope/control/command wire structures.
//!
//! ## Design
//!
//! - **Immutable identities**: a [`ProcessId`] is built once and then only
//!   cloned; it carries no back-pointer to the container hosting it.
//! - **Closed enums**: control messages and commands are closed enums so
//!   dispatch is a `match` or a fixed-size table rather than reflection.
//! - **Serde everywhere**: everything that crosses a socket derives
//!   `Serialize`/`Deserialize`; the codec itself lives in `network`.
//!
//! ## Quick Start
//!
//! ```rust
//! use types::{ChannelCaps, ProcessId, Term};
//!
//! let pid = ProcessId::new("Ping", Some("p1".into()), "localhost", vec![Some(15000), None]);
//! assert_eq!(pid.address(0), Some(("localhost", 15000)));
//! assert!(ChannelCaps::RELIABLE_FIFO.contains(ChannelCaps::FIFO));
//!
//! let msg = Term::tuple(["ping".into(), Term::Pid(pid), 3.into()]);
//! assert_eq!(msg.arity(), Some(3));
//! ```

pub mod caps;
pub mod message;
pub mod process_id;
pub mod term;
pub mod wire;

pub use caps::ChannelCaps;
pub use message::{Command, CommandKind, Control, ControlKind, Envelope, Payload, SetupRequest};
pub use process_id::ProcessId;
pub use term::Term;
pub use wire::{
    DIGEST_LENGTH, FAILURE, KEY_CHALLENGE, NONCE_LENGTH, PROTOCOL_VERSION, UDP_DATA_OFFSET,
    UNAUTHENTICATED_DIGEST, VERSION_BYTES, VER_CHALLENGE, WELCOME,
};
