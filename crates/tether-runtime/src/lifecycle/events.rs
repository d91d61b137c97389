use tether_core::discovery::ServiceInstance;

/// Notification published to lifecycle subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The client connected.
    Connected,
    /// The client disconnected.
    Disconnected,
    /// The watchdog replaced the client.
    Reconnecting { attempt: u64 },
    /// A new registration was published.
    Ready(ServiceInstance),
    /// Publishing a registration failed; the process is not registered.
    RegistrationFailed(String),
}

impl LifecycleEvent {
    /// Event name as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Ready(_) => "ready",
            Self::RegistrationFailed(_) => "registration_failed",
        }
    }

    /// Whether this is a `Ready` event.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}
