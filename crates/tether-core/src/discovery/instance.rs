use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TetherError};

/// Unique service instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Generate a new random instance ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity this process advertises in the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance ID.
    pub id: InstanceId,
    /// Service name.
    pub name: String,
    /// Advertised address.
    pub address: IpAddr,
    /// Advertised port.
    pub port: u16,
    /// When the descriptor was built.
    pub registered_at: DateTime<Utc>,
}

impl ServiceInstance {
    /// Start building a service instance.
    pub fn builder() -> ServiceInstanceBuilder {
        ServiceInstanceBuilder::default()
    }

    /// Path of this instance under a base path.
    pub fn path_under(&self, base_path: &str) -> String {
        instance_path(base_path, &self.name, self.id)
    }

    /// `address:port` as advertised.
    pub fn endpoint(&self) -> String {
        match self.address {
            IpAddr::V4(addr) => format!("{}:{}", addr, self.port),
            IpAddr::V6(addr) => format!("[{}]:{}", addr, self.port),
        }
    }
}

/// Registration path for an instance: `{base}/{name}/{id}`.
pub fn instance_path(base_path: &str, name: &str, id: InstanceId) -> String {
    format!("{}/{}/{}", base_path.trim_end_matches('/'), name, id)
}

/// Builder for [`ServiceInstance`].
#[derive(Debug, Default, Clone)]
pub struct ServiceInstanceBuilder {
    id: Option<InstanceId>,
    address: Option<IpAddr>,
    port: Option<u16>,
    name: Option<String>,
}

impl ServiceInstanceBuilder {
    /// Use a fixed ID instead of generating one.
    pub fn id(mut self, id: InstanceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the advertised address.
    pub fn address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the advertised port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the service name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build the descriptor. Address, port and name are required.
    pub fn build(self) -> Result<ServiceInstance> {
        let address = self
            .address
            .ok_or_else(|| TetherError::Registration("instance address is required".into()))?;
        let port = self
            .port
            .ok_or_else(|| TetherError::Registration("instance port is required".into()))?;
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TetherError::Registration("instance name is required".into()))?;

        Ok(ServiceInstance {
            id: self.id.unwrap_or_default(),
            name,
            address,
            port,
            registered_at: Utc::now(),
        })
    }
}
