//! Process-wide log output.

use tracing_subscriber::EnvFilter;

/// Installs a formatted stderr subscriber. `RUST_LOG` takes precedence over
/// `default_filter`. Returns `false` if a global subscriber already exists.
pub fn init_logging(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
