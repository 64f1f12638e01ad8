use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "ytgrab=info";

/// Filter used when `RUST_LOG` is unset: the library plus the calling binary.
pub fn default_directives(binary: &str) -> String {
    format!("{DEFAULT_FILTER},{binary}=info")
}

/// Installs the global subscriber for `binary`. `RUST_LOG` wins over the
/// default directives.
///
/// Calling this twice is harmless; the second subscriber is dropped.
pub fn init(binary: &str) {
    let default_filter = default_directives(binary);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .try_init();

    if installed.is_ok() {
        tracing::debug!(%default_filter, "logging initialized");
    }
}
