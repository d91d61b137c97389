mod coordinator;
mod observability;

pub use coordinator::{RetryConfig, ZookeeperConfig};
pub use observability::{LoggingConfig, ObservabilityConfig};

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TetherError};

/// Root configuration for a service lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Name the service registers under.
    pub service_name: String,

    /// Base path for registrations.
    #[serde(default = "default_base_path")]
    pub service_base_path: String,

    /// Services this one relies on. Opaque to the lifecycle.
    #[serde(default)]
    pub service_dependencies: Vec<String>,

    /// Verbose lifecycle logging.
    #[serde(default)]
    pub debug: bool,

    /// Coordination service connection.
    pub zookeeper: ZookeeperConfig,

    /// Advertised server endpoint.
    #[serde(default)]
    pub server: ServerConfig,

    /// Reconnection watchdog configuration.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl LifecycleConfig {
    /// Create a configuration with defaults for everything but the essentials.
    pub fn new(connection_string: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_base_path: default_base_path(),
            service_dependencies: Vec::new(),
            debug: false,
            zookeeper: ZookeeperConfig::new(connection_string),
            server: ServerConfig::default(),
            watchdog: WatchdogConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = substitute_env_vars(content);

        let config: Self = toml::from_str(&content)
            .map_err(|e| TetherError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(TetherError::Config("service_name must not be empty".into()));
        }
        if !self.service_base_path.starts_with('/') {
            return Err(TetherError::Config(format!(
                "service_base_path must be absolute: {}",
                self.service_base_path
            )));
        }
        if self.zookeeper.endpoints().is_empty() {
            return Err(TetherError::Config(
                "zookeeper.connection_string must name at least one endpoint".into(),
            ));
        }
        if self.watchdog.interval_ms == 0 {
            return Err(TetherError::Config(
                "watchdog.interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Log level to use, taking the debug flag into account.
    pub fn log_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.observability.logging.level
        }
    }

    /// Set the advertised port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Set the base registration path.
    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        self.service_base_path = path.into();
        self
    }

    /// Set the retry ceiling of the underlying client.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.zookeeper.retry.count = count;
        self
    }

    /// Set the declared service dependencies.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.service_dependencies = deps;
        self
    }
}

/// Advertised server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port advertised in the registration. `PORT` overrides it.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address advertised in the registration. Looked up from the hostname when unset.
    #[serde(default)]
    pub advertise_address: Option<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            advertise_address: None,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_base_path() -> String {
    "/services".to_string()
}

/// Reconnection watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Interval between reconnection attempts in milliseconds.
    #[serde(default = "default_watchdog_interval")]
    pub interval_ms: u64,

    /// How long a stale unregister may take before it is abandoned.
    #[serde(default = "default_unregister_timeout")]
    pub unregister_timeout_ms: u64,
}

impl WatchdogConfig {
    /// Interval between reconnection attempts.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Stale unregister timeout.
    pub fn unregister_timeout(&self) -> Duration {
        Duration::from_millis(self.unregister_timeout_ms)
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_watchdog_interval(),
            unregister_timeout_ms: default_unregister_timeout(),
        }
    }
}

fn default_watchdog_interval() -> u64 {
    1000
}

fn default_unregister_timeout() -> u64 {
    5000
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") else {
        return content.to_string();
    };

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => result = result.replace(&cap[0], &value),
            Err(_) => tracing::debug!("Environment variable {} is not set", var_name),
        }
    }

    result
}
