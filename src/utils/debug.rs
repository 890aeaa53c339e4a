//! Logging setup.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

/// Global debug flag.
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable that enables verbose audit logging.
pub const DEBUG_ENV: &str = "DEBUG";

/// Initialize logging based on the DEBUG environment variable or an explicit flag.
/// NO_COLOR disables ANSI escapes in the log sink.
pub fn init_logging(force_debug: bool) {
    let debug_enabled = force_debug || std::env::var_os(DEBUG_ENV).is_some();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = if debug_enabled {
        EnvFilter::new("procbox=debug,warn")
    } else {
        EnvFilter::new("procbox=info,warn")
    };

    let ansi = std::env::var_os("NO_COLOR").is_none();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(debug_enabled)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Check if debug mode is enabled.
pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::SeqCst)
}
