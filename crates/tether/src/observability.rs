use tracing_subscriber::EnvFilter;

use tether_core::config::LifecycleConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LifecycleConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.observability.logging.json_format {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("{}", e))
    } else {
        builder.try_init().map_err(|e| anyhow::anyhow!("{}", e))
    }
}
