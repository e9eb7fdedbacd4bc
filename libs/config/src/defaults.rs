//! Default values for runtime options.

/// Transport binding defaults
pub mod binding {
    /// Hostname advertised in process ids
    pub const HOSTNAME: &str = "localhost";

    /// Bind attempts before giving up
    pub const BIND_RETRIES: u32 = 3;

    /// Lowest port tried when no port is configured
    pub const MIN_PORT: u16 = 10000;

    /// Highest port tried when no port is configured
    pub const MAX_PORT: u16 = 65535;
}

/// Send path defaults
pub mod sending {
    /// Socket receive buffer size (bytes)
    pub const MESSAGE_BUFFER_SIZE: usize = 4096;

    /// Attempts per send before the error is surfaced
    pub const SEND_RETRIES: u32 = 3;

    /// Sleep between throttled UDP sends (milliseconds)
    pub const UDP_RETRY_WAIT_MS: u64 = 10;

    /// Sleep between failed TCP sends (milliseconds)
    pub const TCP_RETRY_WAIT_MS: u64 = 50;

    /// TCP connect and handshake timeout (milliseconds)
    pub const TCP_CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Largest TCP frame accepted from a peer
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
}

/// Router defaults
pub mod routing {
    /// How long to wait for a HELLO to be answered (milliseconds)
    pub const BOOTSTRAP_TIMEOUT_MS: u64 = 2_000;

    /// Inbound queue poll interval of the router thread (milliseconds)
    pub const POLL_INTERVAL_MS: u64 = 100;

    /// Type name of the per-runtime node process
    pub const NODE_TYPE: &str = "Node";
}

/// Process runtime defaults
pub mod process {
    /// Exit code of a process stopped by a simulated crash
    pub const CRASH_EXIT_CODE: i32 = 10;

    /// How long a node waits for its children to acknowledge `End` on
    /// shutdown (milliseconds)
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
}
