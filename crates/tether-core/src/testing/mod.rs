//! Testing utilities for tether.
//!
//! The in-memory ensemble stands in for a real coordination service. It
//! behaves like one closely enough for the lifecycle's purposes: sessions,
//! ephemeral entries removed on close, connect/disconnect signals, and
//! outages that leave entries behind.
//!
//! # Example
//!
//! ```ignore
//! use tether_core::testing::MemoryEnsemble;
//!
//! let ensemble = MemoryEnsemble::new();
//! let lifecycle = ServiceLifecycle::new(ensemble.factory());
//! lifecycle.initialise(config).await?;
//!
//! ensemble.go_offline();
//! ensemble.go_online();
//! ensemble.assert_no_unregister();
//! ```

pub mod memory;

pub use memory::{MemoryClient, MemoryClientFactory, MemoryEnsemble, RecordedOp};

use std::time::Duration;

/// Default timeout when waiting for lifecycle events in tests.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);
