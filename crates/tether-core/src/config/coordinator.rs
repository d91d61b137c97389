use serde::{Deserialize, Serialize};

/// Coordination service connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZookeeperConfig {
    /// Connection string, a comma separated list of `host:port` endpoints.
    pub connection_string: String,

    /// Retry policy handed to the underlying client.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ZookeeperConfig {
    /// Create a config for the given connection string with default retries.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Split the connection string into its endpoints.
    pub fn endpoints(&self) -> Vec<String> {
        self.connection_string
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Client retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retry ceiling for the underlying client.
    #[serde(default = "default_retry_count")]
    pub count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
        }
    }
}

fn default_retry_count() -> u32 {
    3
}
