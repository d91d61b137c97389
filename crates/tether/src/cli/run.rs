use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use tether_core::{ClientFactory, LifecycleConfig};
use tether_runtime::{LifecycleEvent, ServiceLifecycle};

use super::load_config;

/// Register this process and keep the registration alive.
#[derive(Parser)]
pub struct RunCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "tether.toml")]
    pub config: String,

    /// Port to advertise (overrides config).
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,
}

impl RunCommand {
    /// Execute the run command.
    pub async fn execute(self) -> Result<()> {
        let mut config = load_config(&self.config)?;
        self.apply_overrides(&mut config);
        tether::observability::init_tracing(&config)?;

        println!();
        println!(
            "  {} v{}",
            style("TETHER").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!(
            "  Registering {} under {} via {}",
            style(&config.service_name).bold(),
            config.service_base_path,
            style(&config.zookeeper.connection_string).cyan()
        );
        println!();

        info!("Loaded configuration from {}", self.config);

        let lifecycle = ServiceLifecycle::with_factory(client_factory(&config)?);
        let mut events = lifecycle.subscribe();
        lifecycle.initialise(config).await?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
                event = events.recv() => match event {
                    Ok(LifecycleEvent::Ready(instance)) => {
                        println!(
                            "  {} Registered {} at {}",
                            style("✓").green().bold(),
                            instance.id,
                            style(instance.endpoint()).cyan()
                        );
                    }
                    Ok(LifecycleEvent::RegistrationFailed(e)) => {
                        println!("  {} Registration failed: {}", style("✗").red().bold(), e);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Skipped {} lifecycle events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        if let Err(e) = lifecycle.deregister().await {
            tracing::warn!("Failed to deregister: {}", e);
        }
        lifecycle.close().await?;

        println!("\n  Goodbye!");
        Ok(())
    }

    fn apply_overrides(&self, config: &mut LifecycleConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.debug {
            config.debug = true;
        }
    }
}

#[cfg(feature = "etcd")]
fn client_factory(config: &LifecycleConfig) -> Result<Arc<dyn ClientFactory>> {
    Ok(Arc::new(
        tether_runtime::EtcdClientFactory::new().with_retry_window(config.watchdog.interval()),
    ))
}

#[cfg(not(feature = "etcd"))]
fn client_factory(_config: &LifecycleConfig) -> Result<Arc<dyn ClientFactory>> {
    anyhow::bail!("tether was built without a coordination backend; rebuild with --features etcd")
}
