//! # DistProc Runtime Configuration
//!
//! Options shared by the transports, the router and the process runtime.
//!
//! ## Features
//!
//! - **Defaults**: every option has a default, see [`defaults`]
//! - **Layering**: defaults, then an optional TOML file, then `DISTPROC_*`
//!   environment variables
//! - **Validation**: inconsistent combinations are rejected up front
//!
//! ## Usage
//!
//! ```rust
//! use runtime_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::default();
//! assert_eq!(config.min_port, 10000);
//! config.validate().unwrap();
//! ```

pub mod defaults;
pub mod runtime_config;

pub use runtime_config::{ClockKind, FailureRates, RuntimeConfig};
