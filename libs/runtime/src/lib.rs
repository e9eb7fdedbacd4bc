//! # DistProc Process Runtime
//!
//! Processes that talk to each other through the [`network::Router`]:
//! spawn/setup/start/end commands with acknowledgement correlation, logical
//! clocks, event patterns with deferred handlers, and label checkpoints
//! deciding when those handlers run.
//!
//! ## Pieces
//!
//! - **[`Runtime`]**: one per node; owns the router and the process registry
//! - **[`DistProcess`]**: the runtime side of a process, generic over the
//!   user's [`ProcessType`]
//! - **[`Node`]**: the per-runtime process that spawns children and tracks
//!   other nodes
//! - **[`EventPattern`] / [`Handler`]**: what a process reacts to, and when
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use distproc::{DistProcess, ProcessRegistry, ProcessType, Runtime, Spawn};
//! use runtime_config::RuntimeConfig;
//!
//! #[derive(Default)]
//! struct Hello;
//!
//! impl ProcessType for Hello {
//!     const TYPE_NAME: &'static str = "Hello";
//!
//!     fn run(p: &mut DistProcess<Self>) -> distproc::Result<()> {
//!         if let Some(parent) = p.parent().cloned() {
//!             p.send("hello", &parent)?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let registry = ProcessRegistry::new().with::<Hello>();
//! let runtime = Runtime::start("main", RuntimeConfig::default(), registry)?;
//! let mut node = runtime.node()?;
//! let children = node.new_processes_with_setup(&Spawn::of::<Hello>().count(3), vec![])?;
//! node.start(&children)?;
//! node.shutdown()?;
//! # Ok::<(), distproc::ProcessError>(())
//! ```

pub mod correlation;
pub mod error;
pub mod events;
pub mod logging;
pub mod node;
pub mod pattern;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod stats;

pub use correlation::{next_seqno, CorrelationTable};
pub use error::{ProcessError, Result};
pub use events::{Event, EventKind, EventPattern, Handler};
pub use node::Node;
pub use pattern::{Bindings, MatchContext, NoContext, Pattern};
pub use process::{CommandFn, DistProcess, Phase, ProcessType};
pub use registry::{ProcessRegistry, Spawn};
pub use runtime::Runtime;
pub use stats::StatsSnapshot;
