//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Diagnostics go to stderr so they never interleave with the transcript on
/// stdout. The `--log-level` value seeds the filter; a `RUST_LOG` environment
/// variable takes precedence when present. Safe to call more than once; only
/// the first call installs anything.
pub fn init_subscriber(default_level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::new(default_level),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
