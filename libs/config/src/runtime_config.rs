//! Runtime Configuration Module
//!
//! Loads [`RuntimeConfig`] from built-in defaults, an optional TOML file and
//! `DISTPROC_*` environment variables, in that order of precedence.

use crate::defaults::{binding, routing, sending};
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use types::ChannelCaps;

/// Logical clock flavour a process may opt into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockKind {
    Lamport,
}

/// Simulated failure probabilities, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FailureRates {
    /// Drop an outgoing message
    pub send: f64,
    /// Drop an incoming message
    pub receive: f64,
    /// Terminate the process at a label
    pub crash: f64,
}

impl FailureRates {
    pub fn is_zero(&self) -> bool {
        self.send == 0.0 && self.receive == 0.0 && self.crash == 0.0
    }
}

/// Options for one runtime instance.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Hostname advertised in process ids
    pub hostname: String,
    /// Port to bind first; `None` picks one at random from the range
    pub port: Option<u16>,
    /// Fail instead of retrying when `port` is taken
    pub strict: bool,
    /// Step ports by one instead of picking randomly
    pub linear: bool,
    pub bind_retries: u32,
    pub min_port: u16,
    pub max_port: u16,
    pub message_buffer_size: usize,
    /// Shared HMAC key; `None` disables authentication
    pub authkey: Option<String>,

    pub send_retries: u32,
    pub udp_retry_wait_ms: u64,
    pub tcp_retry_wait_ms: u64,
    pub retry_refused_connections: bool,
    pub tcp_connect_timeout_ms: u64,
    pub max_frame_size: usize,

    pub clock: Option<ClockKind>,
    /// Process every queued event at each label instead of one
    pub handle_all: bool,
    /// Capability names required for user messages
    pub default_channel: Vec<String>,
    pub bootstrap_timeout_ms: u64,
    /// Upper bound on async-command waits; `None` waits indefinitely
    pub command_timeout_ms: Option<u64>,
    pub failures: FailureRates,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            hostname: binding::HOSTNAME.to_string(),
            port: None,
            strict: false,
            linear: false,
            bind_retries: binding::BIND_RETRIES,
            min_port: binding::MIN_PORT,
            max_port: binding::MAX_PORT,
            message_buffer_size: sending::MESSAGE_BUFFER_SIZE,
            authkey: None,
            send_retries: sending::SEND_RETRIES,
            udp_retry_wait_ms: sending::UDP_RETRY_WAIT_MS,
            tcp_retry_wait_ms: sending::TCP_RETRY_WAIT_MS,
            retry_refused_connections: false,
            tcp_connect_timeout_ms: sending::TCP_CONNECT_TIMEOUT_MS,
            max_frame_size: sending::MAX_FRAME_SIZE,
            clock: None,
            handle_all: false,
            default_channel: Vec::new(),
            bootstrap_timeout_ms: routing::BOOTSTRAP_TIMEOUT_MS,
            command_timeout_ms: None,
            failures: FailureRates::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration, layering defaults, `path` (if given) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&RuntimeConfig::default())
            .context("Failed to serialize default configuration")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            info!("Loading runtime config: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        // Override with environment variables (DISTPROC_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("DISTPROC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: RuntimeConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(?config, "runtime configuration loaded");
        Ok(config)
    }

    /// Reject option combinations the transports cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            bail!(
                "min_port ({}) is greater than max_port ({})",
                self.min_port,
                self.max_port
            );
        }
        if self.message_buffer_size == 0 {
            bail!("message_buffer_size must be positive");
        }
        if self.strict && self.port.is_none() {
            bail!("strict binding requires an explicit port");
        }
        for (name, rate) in [
            ("send", self.failures.send),
            ("receive", self.failures.receive),
            ("crash", self.failures.crash),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("failure rate '{}' must be within [0, 1], got {}", name, rate);
            }
        }
        self.default_caps()?;
        Ok(())
    }

    /// Capabilities required for user messages.
    pub fn default_caps(&self) -> Result<ChannelCaps> {
        ChannelCaps::from_names(&self.default_channel)
            .map_err(|name| anyhow::anyhow!("unknown channel capability '{}'", name))
    }

    pub fn authkey_bytes(&self) -> Option<&[u8]> {
        self.authkey.as_deref().map(str::as_bytes)
    }

    pub fn udp_retry_wait(&self) -> Duration {
        Duration::from_millis(self.udp_retry_wait_ms)
    }

    pub fn tcp_retry_wait(&self) -> Duration {
        Duration::from_millis(self.tcp_retry_wait_ms)
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bind_retries, 3);
        assert_eq!(config.message_buffer_size, 4096);
        assert_eq!(config.udp_retry_wait(), Duration::from_millis(10));
        assert!(config.failures.is_zero());
    }

    #[test]
    fn test_load_file_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("runtime.toml");

        let config_content = r#"
hostname = "node-a"
port = 15000
linear = true
authkey = "secret"
clock = "lamport"
default_channel = ["fifo", "reliable"]

[failures]
send = 0.25
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = RuntimeConfig::load(Some(&config_path)).unwrap();

        assert_eq!(config.hostname, "node-a");
        assert_eq!(config.port, Some(15000));
        assert!(config.linear);
        assert_eq!(config.authkey_bytes(), Some(&b"secret"[..]));
        assert_eq!(config.clock, Some(ClockKind::Lamport));
        assert_eq!(config.default_caps().unwrap(), ChannelCaps::RELIABLE_FIFO);
        assert_eq!(config.failures.send, 0.25);
        assert_eq!(config.failures.crash, 0.0);
        // untouched keys keep their defaults
        assert_eq!(config.max_port, 65535);
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let config = RuntimeConfig {
            min_port: 20000,
            max_port: 10000,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_failure_rate_rejected() {
        let mut config = RuntimeConfig::default();
        config.failures.receive = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("receive"));
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let config = RuntimeConfig {
            default_channel: vec!["teleport".into()],
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_override() {
        std::env::set_var("DISTPROC_BOOTSTRAP_TIMEOUT_MS", "750");
        let config = RuntimeConfig::load(None).unwrap();
        std::env::remove_var("DISTPROC_BOOTSTRAP_TIMEOUT_MS");
        assert_eq!(config.bootstrap_timeout(), Duration::from_millis(750));
    }
}
