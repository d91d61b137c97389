//! Lifecycle state machine.
//!
//! Transitions are a pure function of the current state and an input. The
//! lifecycle task executes the returned effects in order.

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// `initialise` has not been called.
    #[default]
    Uninitialised,
    /// A client was started and has not connected yet.
    Connecting,
    /// Connected, registration published (or attempted).
    Connected,
    /// Connection lost, watchdog armed.
    Disconnected,
    /// Watchdog has replaced the client at least once.
    Reconnecting,
    /// Handles released by `close`.
    Closed,
}

impl LifecycleState {
    /// State name as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialised => "uninitialised",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// Whether connection signals are acted upon in this state.
    pub fn is_armed(&self) -> bool {
        !matches!(self, Self::Uninitialised | Self::Closed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    /// `initialise` was called.
    Initialise,
    /// The current client connected.
    Connected,
    /// The current client disconnected.
    Disconnected,
    /// The live watchdog timer fired.
    WatchdogTick,
    /// `close` was called.
    Close,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Build a client, attach the monitor to it and start it.
    AttachClient,
    /// Move the live registration into the stale slot.
    InvalidateRegistration,
    /// Unregister the stale registration through the current client.
    UnregisterStale,
    /// Cancel the watchdog timer.
    CancelWatchdog,
    /// Arm a fresh watchdog timer.
    StartWatchdog,
    /// Build and publish a registration, then emit `Ready`.
    Register,
    /// Replace the current client with a new one.
    Reconnect,
    /// Echo the connected signal to subscribers.
    EmitConnected,
    /// Echo the disconnected signal to subscribers.
    EmitDisconnected,
    /// Drop client, instance and discovery handle without network calls.
    Release,
}

/// Result of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the effects ran.
    pub next: LifecycleState,
    /// Effects to run, in order.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: LifecycleState, effects: &[Effect]) -> Self {
        Self {
            next,
            effects: effects.to_vec(),
        }
    }

    fn stay(state: LifecycleState) -> Self {
        Self::to(state, &[])
    }
}

/// Compute the transition for `input` in `state`.
pub fn transition(state: LifecycleState, input: LifecycleInput) -> Transition {
    use Effect::*;
    use LifecycleInput as I;
    use LifecycleState as S;

    match (state, input) {
        // Re-arming from any state. Subscriptions are replaced, never added.
        (_, I::Initialise) => Transition::to(
            S::Connecting,
            &[AttachClient, CancelWatchdog, InvalidateRegistration],
        ),
        (_, I::Close) => Transition::to(S::Closed, &[CancelWatchdog, Release]),
        (S::Uninitialised | S::Closed, _) => Transition::stay(state),
        (_, I::Connected) => Transition::to(
            S::Connected,
            &[
                EmitConnected,
                InvalidateRegistration,
                UnregisterStale,
                CancelWatchdog,
                Register,
            ],
        ),
        (_, I::Disconnected) => Transition::to(
            S::Disconnected,
            &[
                InvalidateRegistration,
                CancelWatchdog,
                StartWatchdog,
                EmitDisconnected,
            ],
        ),
        (S::Disconnected | S::Reconnecting, I::WatchdogTick) => {
            Transition::to(S::Reconnecting, &[Reconnect])
        }
        // A tick that raced with cancellation.
        (_, I::WatchdogTick) => Transition::stay(state),
    }
}
