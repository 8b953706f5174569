//! Logging utilities with boot plugin segment prefixes.
//!
//! Stdout belongs to the handshake protocol, so every subscriber set up here
//! writes to stderr.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with plugin defaults (`info`, overridable via RUST_LOG).
pub fn init() {
    init_with_filter("info");
}

/// Initialize tracing with a custom default filter.
///
/// `RUST_LOG` still wins when it is set.
pub fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Install a panic hook that reports to stderr.
///
/// The default hook also writes to stderr, but the plugin's parent only
/// captures a short tail of it; this keeps location and message together.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: Plugin panicked during startup or execution");
        eprintln!(
            "  Location: {}",
            panic_info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("<no message>");
        eprintln!("  Message: {}", message);
    }));
}

/// Segment prefixes for logging.
pub mod prefix {
    /// Graceful startup prefix
    pub const PULSE_OPEN: &str = "✿";
    /// Graceful shutdown prefix
    pub const PULSE_CLOSE: &str = "❀";
}
