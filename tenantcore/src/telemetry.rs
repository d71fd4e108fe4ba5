//! Log subscriber setup.

use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (for example the
/// `log_filter` of [`crate::config::TenantcoreConfig`]) applies. Returns `false`
/// if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    tracing_subscriber::fmt()
        .with_env_filter(select_filter(from_env.as_deref(), default_filter))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Builds the filter from the `RUST_LOG` value, falling back to
/// `default_filter` when it is unset or does not parse.
fn select_filter(from_env: Option<&str>, default_filter: &str) -> EnvFilter {
    from_env
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}
