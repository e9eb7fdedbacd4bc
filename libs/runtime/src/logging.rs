//! Logging setup for programs embedding the runtime.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `filter`, or by `RUST_LOG` when
/// `filter` is `None` (default level `info`).
///
/// Returns `false` when a global subscriber was already installed, in which
/// case nothing changes.
pub fn init(filter: Option<&str>) -> bool {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init(Some("distproc=debug"));
        assert!(!init(None));
    }
}
