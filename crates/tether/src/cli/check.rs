use anyhow::Result;
use clap::Parser;
use console::style;

use tether_core::LifecycleConfig;
use tether_runtime::lifecycle::current_port;

use super::load_config;

/// Validate a configuration file and show the resolved registration.
#[derive(Parser)]
pub struct CheckCommand {
    /// Configuration file path.
    #[arg(short, long, default_value = "tether.toml")]
    pub config: String,
}

impl CheckCommand {
    /// Execute the check command.
    pub fn execute(self) -> Result<()> {
        let config = load_config(&self.config)?;

        println!("  {} {} is valid", style("✓").green().bold(), self.config);
        for line in summary(&config) {
            println!("    {}", line);
        }
        Ok(())
    }
}

/// What would be registered with this configuration.
fn summary(config: &LifecycleConfig) -> Vec<String> {
    let dependencies = if config.service_dependencies.is_empty() {
        "none".to_string()
    } else {
        config.service_dependencies.join(", ")
    };

    vec![
        format!("service:      {}", config.service_name),
        format!("base path:    {}", config.service_base_path),
        format!("endpoints:    {}", config.zookeeper.endpoints().join(", ")),
        format!("retries:      {}", config.zookeeper.retry.count),
        format!("port:         {}", current_port(config.server.port)),
        format!("watchdog:     {:?}", config.watchdog.interval()),
        format!("dependencies: {}", dependencies),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lists_registration() {
        let config = LifecycleConfig::new("a:2181, b:2181", "svc-a")
            .with_dependencies(vec!["svc-b".into(), "svc-c".into()]);

        let lines = summary(&config);

        assert!(lines.contains(&"service:      svc-a".to_string()));
        assert!(lines.contains(&"base path:    /services".to_string()));
        assert!(lines.contains(&"endpoints:    a:2181, b:2181".to_string()));
        assert!(lines.contains(&"dependencies: svc-b, svc-c".to_string()));
    }

    #[test]
    fn test_summary_without_dependencies() {
        let config = LifecycleConfig::new("host:2181", "svc-a");
        assert!(summary(&config).contains(&"dependencies: none".to_string()));
    }
}
