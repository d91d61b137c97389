mod client;
mod handle;
mod instance;

pub use client::{ClientFactory, ClientSignal, CoordinationClient};
pub use handle::{ServiceDiscovery, ServiceDiscoveryBuilder};
pub use instance::{instance_path, InstanceId, ServiceInstance, ServiceInstanceBuilder};
