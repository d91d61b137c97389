use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use super::instance::ServiceInstance;
use crate::error::Result;

/// Transport-level signal raised by a coordination client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSignal {
    /// A session with the coordination service is established.
    Connected,
    /// The session was lost.
    Disconnected,
}

impl ClientSignal {
    /// Signal name as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ClientSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handle to a connection with the coordination service.
///
/// Implementations own the session and its ephemeral entries. Entries
/// registered through a client are expected to vanish when its session ends.
pub trait CoordinationClient: Send + Sync + 'static {
    /// Connection string this client was built from.
    fn connection_string(&self) -> &str;

    /// Begin connecting. Must not block; the outcome arrives as a signal.
    fn start(&self) -> Result<()>;

    /// Subscribe to connection signals.
    ///
    /// Signals raised before the receiver exists are not replayed, so callers
    /// subscribe before calling [`start`](Self::start).
    fn signals(&self) -> broadcast::Receiver<ClientSignal>;

    /// Create an ephemeral entry holding `instance` at `path`.
    fn register<'a>(
        &'a self,
        path: &'a str,
        instance: &'a ServiceInstance,
    ) -> BoxFuture<'a, Result<()>>;

    /// Remove the entry at `path`.
    fn unregister<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Release the session. No further signals are raised.
    fn close(&self);
}

/// Constructs coordination clients.
pub trait ClientFactory: Send + Sync + 'static {
    /// Build a new, not yet started, client.
    fn new_client(
        &self,
        connection_string: &str,
        retry_count: u32,
    ) -> Result<Arc<dyn CoordinationClient>>;
}
