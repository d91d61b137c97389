//! tether - keeps a process registered with a coordination service.
//!
//! The lifecycle survives connection loss: stale registrations are removed
//! before a fresh one is published, and a watchdog rebuilds the client until
//! the connection returns.

pub mod observability;

#[doc(hidden)]
pub use tether_core;

pub use tether_core::{
    ClientFactory, ClientSignal, CoordinationClient, InstanceId, LifecycleConfig, Result,
    ServiceDiscovery, ServiceInstance, TetherError,
};
pub use tether_runtime::{LifecycleEvent, LifecycleSnapshot, LifecycleState, ServiceLifecycle};

#[cfg(feature = "etcd")]
pub use tether_runtime::{EtcdClient, EtcdClientFactory};

#[cfg(feature = "testing")]
pub use tether_core::testing;
