use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Installs a `tracing-subscriber` writer to stderr, once per process.
/// Verbosity is controlled by `LIBWRITEDEDUPER_LOG` (already folded into
/// `ShimConfig::log_filter` by the time this is called). Every diagnostic
/// emitted by this crate uses `target: "writededuper"` as the fixed shim
/// tag spec.md §6 requires, so filtering or grepping on that target
/// isolates shim output from the host process's own logging.
pub fn init(log_filter: &str) {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}
