use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::client::CoordinationClient;
use super::instance::{instance_path, InstanceId, ServiceInstance};
use crate::error::{Result, TetherError};

/// Live binding between a client and a published service instance.
pub struct ServiceDiscovery {
    client: Arc<dyn CoordinationClient>,
    instance: ServiceInstance,
    base_path: String,
    registered: AtomicBool,
}

impl ServiceDiscovery {
    /// Start building a discovery handle.
    pub fn builder() -> ServiceDiscoveryBuilder {
        ServiceDiscoveryBuilder::default()
    }

    /// The registered descriptor, or `None` once it has been unregistered.
    pub fn get_data(&self) -> Option<&ServiceInstance> {
        if self.registered.load(Ordering::SeqCst) {
            Some(&self.instance)
        } else {
            None
        }
    }

    /// The descriptor this handle was built for, registered or not.
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// Base registration path.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Path of this handle's own entry.
    pub fn instance_path(&self) -> String {
        self.instance.path_under(&self.base_path)
    }

    /// Unregister a service instance of this service by ID.
    pub async fn unregister_service(&self, id: InstanceId) -> Result<()> {
        let path = instance_path(&self.base_path, &self.instance.name, id);
        self.client.unregister(&path).await?;

        if id == self.instance.id {
            self.registered.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Same registration, reached through another client.
    ///
    /// Used to clean up an entry whose own session is gone.
    pub fn rebind(&self, client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            client,
            instance: self.instance.clone(),
            base_path: self.base_path.clone(),
            registered: AtomicBool::new(self.registered.load(Ordering::SeqCst)),
        }
    }
}

impl std::fmt::Debug for ServiceDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDiscovery")
            .field("instance", &self.instance)
            .field("base_path", &self.base_path)
            .field("registered", &self.registered.load(Ordering::SeqCst))
            .finish()
    }
}

/// Builder for [`ServiceDiscovery`].
#[derive(Default)]
pub struct ServiceDiscoveryBuilder {
    client: Option<Arc<dyn CoordinationClient>>,
    instance: Option<ServiceInstance>,
    base_path: Option<String>,
}

impl ServiceDiscoveryBuilder {
    /// Client to publish through.
    pub fn client(mut self, client: Arc<dyn CoordinationClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// The instance to publish.
    pub fn this_instance(mut self, instance: ServiceInstance) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Base registration path.
    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Publish the instance and return the live handle.
    pub async fn build(self) -> Result<ServiceDiscovery> {
        let client = self
            .client
            .ok_or_else(|| TetherError::Registration("discovery client is required".into()))?;
        let instance = self
            .instance
            .ok_or_else(|| TetherError::Registration("discovery instance is required".into()))?;
        let base_path = self
            .base_path
            .ok_or_else(|| TetherError::Registration("discovery base path is required".into()))?;

        let path = instance.path_under(&base_path);
        client.register(&path, &instance).await?;

        Ok(ServiceDiscovery {
            client,
            instance,
            base_path,
            registered: AtomicBool::new(true),
        })
    }
}
