use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tether_core::config::LifecycleConfig;
use tether_core::discovery::{CoordinationClient, ServiceDiscovery, ServiceInstance};
use tether_core::{Result, TetherError};

use super::resolve::current_port;

/// Owns the registration this process advertises.
///
/// A registration invalidated by a lost session is parked in the stale list
/// until the next connect cycle removes it.
#[derive(Default)]
pub(crate) struct RegistrationManager {
    instance: Option<ServiceInstance>,
    discovery: Option<Arc<ServiceDiscovery>>,
    stale: Vec<Arc<ServiceDiscovery>>,
}

impl RegistrationManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current descriptor.
    pub fn instance(&self) -> Option<&ServiceInstance> {
        self.instance.as_ref()
    }

    /// Current discovery handle.
    pub fn discovery(&self) -> Option<&Arc<ServiceDiscovery>> {
        self.discovery.as_ref()
    }

    /// Registrations waiting to be unregistered.
    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    /// Whether a live registration exists.
    pub fn is_registered(&self) -> bool {
        self.discovery
            .as_ref()
            .is_some_and(|d| d.get_data().is_some())
    }

    /// Unset the descriptor and park the live registration as stale.
    pub fn invalidate(&mut self) {
        self.instance = None;
        if let Some(discovery) = self.discovery.take() {
            if discovery.get_data().is_some() {
                self.stale.push(discovery);
            }
        }
    }

    /// Unregister every stale registration through `client`.
    ///
    /// Failures are logged and the entry is dropped either way.
    pub async fn unregister_stale(
        &mut self,
        client: &Arc<dyn CoordinationClient>,
        timeout: Duration,
        debug: bool,
    ) {
        for stale in std::mem::take(&mut self.stale) {
            let Some(id) = stale.get_data().map(|data| data.id) else {
                continue;
            };

            let handle = stale.rebind(client.clone());
            match with_timeout(timeout, handle.unregister_service(id)).await {
                Ok(()) => {
                    if debug {
                        tracing::info!("Unregistered expired service {}", id);
                    } else {
                        tracing::debug!("Unregistered expired service {}", id);
                    }
                }
                Err(e @ TetherError::Timeout(_)) => {
                    tracing::warn!("Unregistering expired service {}: {}", id, e);
                }
                Err(e) if debug => {
                    tracing::warn!("Failed to unregister expired service {}: {}", id, e);
                }
                Err(e) => {
                    tracing::debug!("Failed to unregister expired service {}: {}", id, e);
                }
            }
        }
    }

    /// Build and publish a fresh registration through `client`.
    pub async fn register(
        &mut self,
        client: &Arc<dyn CoordinationClient>,
        config: &LifecycleConfig,
        address: IpAddr,
    ) -> Result<ServiceInstance> {
        let instance = ServiceInstance::builder()
            .address(address)
            .port(current_port(config.server.port))
            .name(config.service_name.as_str())
            .build()?;

        let discovery = ServiceDiscovery::builder()
            .client(client.clone())
            .this_instance(instance.clone())
            .base_path(config.service_base_path.as_str())
            .build()
            .await?;

        self.instance = Some(instance.clone());
        self.discovery = Some(Arc::new(discovery));
        Ok(instance)
    }

    /// Remove the live registration from the coordination service.
    pub async fn deregister(&mut self) -> Result<Option<ServiceInstance>> {
        let Some(discovery) = self.discovery.clone() else {
            return Ok(None);
        };
        let Some(instance) = discovery.get_data().cloned() else {
            return Ok(None);
        };

        discovery.unregister_service(instance.id).await?;
        self.instance = None;
        self.discovery = None;
        Ok(Some(instance))
    }

    /// Forget everything without touching the coordination service.
    pub fn release(&mut self) {
        self.instance = None;
        self.discovery = None;
        self.stale.clear();
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    operation: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| TetherError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tether_core::testing::MemoryEnsemble;

    fn config() -> LifecycleConfig {
        LifecycleConfig::new("host:2181", "svc-a")
            .with_port(8080)
            .with_base_path("/services")
    }

    fn address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[tokio::test]
    async fn test_register_publishes_descriptor() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connected_client("host:2181");
        let mut manager = RegistrationManager::new();

        let instance = manager.register(&client, &config(), address()).await.unwrap();

        assert!(manager.is_registered());
        assert_eq!(instance.name, "svc-a");
        assert_eq!(instance.address, address());
        assert_eq!(manager.instance(), Some(&instance));
        assert_eq!(
            ensemble.registered_paths(),
            vec![format!("/services/svc-a/{}", instance.id)]
        );
    }

    #[tokio::test]
    async fn test_invalidate_parks_registration() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connected_client("host:2181");
        let mut manager = RegistrationManager::new();
        manager.register(&client, &config(), address()).await.unwrap();

        manager.invalidate();

        assert!(!manager.is_registered());
        assert!(manager.instance().is_none());
        assert_eq!(manager.stale_count(), 1);
    }

    #[tokio::test]
    async fn test_unregister_stale_uses_new_client() {
        let ensemble = MemoryEnsemble::new();
        let old_client = ensemble.connected_client("host:2181");
        let mut manager = RegistrationManager::new();
        let old = manager.register(&old_client, &config(), address()).await.unwrap();

        ensemble.go_offline();
        manager.invalidate();
        ensemble.go_online();

        let new_client = ensemble.connected_client("host:2181");
        manager
            .unregister_stale(&new_client, Duration::from_secs(1), true)
            .await;

        assert_eq!(manager.stale_count(), 0);
        assert_eq!(
            ensemble.unregistered_paths(),
            vec![format!("/services/svc-a/{}", old.id)]
        );
        assert_eq!(ensemble.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_stale_failure_is_swallowed() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connected_client("host:2181");
        let mut manager = RegistrationManager::new();
        manager.register(&client, &config(), address()).await.unwrap();
        manager.invalidate();

        ensemble.reject_unregister(true);
        manager
            .unregister_stale(&client, Duration::from_secs(1), false)
            .await;

        assert_eq!(manager.stale_count(), 0);
        assert_eq!(ensemble.unregistered_paths().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stale_gives_up_after_timeout() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connected_client("host:2181");
        let mut manager = RegistrationManager::new();
        manager.register(&client, &config(), address()).await.unwrap();
        manager.invalidate();

        ensemble.stall_unregister(true);
        manager
            .unregister_stale(&client, Duration::from_millis(200), true)
            .await;

        assert_eq!(manager.stale_count(), 0);
        assert_eq!(ensemble.unregistered_paths().len(), 1);
        assert_eq!(ensemble.entry_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_reports_elapsed_limit() {
        let limit = Duration::from_millis(50);

        let result = with_timeout(limit, std::future::pending::<Result<()>>()).await;
        assert!(matches!(result, Err(TetherError::Timeout(d)) if d == limit));

        let result = with_timeout(limit, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_deregister_removes_entry() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connected_client("host:2181");
        let mut manager = RegistrationManager::new();
        let instance = manager.register(&client, &config(), address()).await.unwrap();

        let removed = manager.deregister().await.unwrap();

        assert_eq!(removed, Some(instance));
        assert!(!manager.is_registered());
        assert_eq!(ensemble.entry_count(), 0);
        assert_eq!(manager.deregister().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_makes_no_calls() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connected_client("host:2181");
        let mut manager = RegistrationManager::new();
        manager.register(&client, &config(), address()).await.unwrap();
        manager.invalidate();

        manager.release();

        assert_eq!(manager.stale_count(), 0);
        ensemble.assert_no_unregister();
        assert_eq!(ensemble.entry_count(), 1);
    }
}
