pub mod config;
pub mod discovery;
pub mod error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::LifecycleConfig;
pub use discovery::{
    ClientFactory, ClientSignal, CoordinationClient, InstanceId, ServiceDiscovery,
    ServiceInstance,
};
pub use error::{Result, TetherError};
