pub mod lifecycle;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use lifecycle::{LifecycleEvent, LifecycleSnapshot, LifecycleState, ServiceLifecycle};

#[cfg(feature = "etcd")]
pub use etcd::{EtcdClient, EtcdClientFactory};
