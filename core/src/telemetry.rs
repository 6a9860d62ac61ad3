// Logging setup
use tracing_subscriber::{fmt, EnvFilter};

/// Install a compact fmt subscriber on stderr, filtered by `RUST_LOG`
/// (default `info`). Later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
