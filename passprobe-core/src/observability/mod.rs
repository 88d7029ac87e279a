//! Observability infrastructure: structured logging and run metrics.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize logging.
///
/// `RUST_LOG` takes precedence over `level` when set. Must be called once, at
/// startup, before any device is touched.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()?;

    metrics::register_metrics();

    tracing::debug!(level, "Observability initialized");
    Ok(())
}
