//! Structured logging setup, mirroring the teacher's own
//! `tracing_subscriber` bring-up: try `RUST_LOG` first, then fall back to a
//! default filter gated on [`crate::env::ZYPAK_DEBUG`].

use tracing_subscriber::EnvFilter;

/// Initialises the global tracing subscriber. Call this once, as early in
/// `main` as possible, before anything that might log.
pub fn init() {
    let default_level = if crate::env::truthy(crate::env::ZYPAK_DEBUG) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("zypak_sandbox={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Emits a fatal diagnostic through `tracing` and mirrors it to stderr as a
/// single line prefixed with the process identity and PID, since the
/// tracing subscriber is not guaranteed to be attached in every embedding
/// (spec's user-visible fatal-path contract).
pub fn fatal(message: impl std::fmt::Display) {
    tracing::error!("{message}");
    eprintln!("zypak-sandbox[{}]: {message}", std::process::id());
}
