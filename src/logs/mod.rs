use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

#[cfg(feature = "diagnostics")]
pub fn default_log_level() -> &'static str {
    "trace"
}

#[cfg(not(feature = "diagnostics"))]
pub fn default_log_level() -> &'static str {
    "warn"
}

/// Installs the global fmt subscriber. Later calls are no-ops.
///
/// `level` is an `EnvFilter` directive. With `None`, `RUST_LOG` is used
/// when set, `default_log_level()` otherwise.
pub fn init_logging(level: Option<&str>) {
    INIT.call_once(|| {
        let env_filter = match level {
            Some(level) => EnvFilter::new(level),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_log_level())),
        };
        let installed = tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .finish(),
        );
        if installed.is_err() {
            // somebody else owns the global subscriber
            return;
        }
        tracing::trace!("logging initialized");
    });
}
