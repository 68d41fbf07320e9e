use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize structured logging for an embedding application.
///
/// Defaults to INFO; `RUST_LOG` overrides per module. Calling this more
/// than once (or alongside a subscriber the host already installed) is
/// a no-op.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .try_init();
}
