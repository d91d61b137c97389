use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use tether_core::config::LifecycleConfig;
use tether_core::discovery::{
    ClientFactory, ClientSignal, CoordinationClient, ServiceDiscovery, ServiceInstance,
};
use tether_core::{Result, TetherError};

use super::command::Command;
use super::events::LifecycleEvent;
use super::monitor::ConnectionMonitor;
use super::registration::RegistrationManager;
use super::resolve::resolve_address;
use super::state::{transition, Effect, LifecycleInput, LifecycleState};
use super::watchdog::ReconnectWatchdog;

const EVENT_CAPACITY: usize = 64;

/// Point-in-time view of the lifecycle, as seen by accessors.
#[derive(Clone, Default)]
pub struct LifecycleSnapshot {
    pub state: LifecycleState,
    pub initialised: bool,
    pub client: Option<Arc<dyn CoordinationClient>>,
    pub instance: Option<ServiceInstance>,
    pub discovery: Option<Arc<ServiceDiscovery>>,
    pub dependencies: Vec<String>,
    pub reconnect_attempts: u64,
}

impl LifecycleSnapshot {
    /// Whether a live registration is visible.
    pub fn is_registered(&self) -> bool {
        self.discovery
            .as_ref()
            .is_some_and(|d| d.get_data().is_some())
    }
}

impl std::fmt::Debug for LifecycleSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleSnapshot")
            .field("state", &self.state)
            .field("initialised", &self.initialised)
            .field(
                "client",
                &self.client.as_ref().map(|c| c.connection_string().to_string()),
            )
            .field("instance", &self.instance)
            .field("registered", &self.is_registered())
            .field("dependencies", &self.dependencies)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .finish()
    }
}

/// Handle to a process's service registration lifecycle.
///
/// Cloning is cheap; all clones drive the same lifecycle task. The task stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct ServiceLifecycle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<LifecycleSnapshot>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ServiceLifecycle {
    /// Spawn a lifecycle task building clients with `factory`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(factory: impl ClientFactory) -> Self {
        Self::with_factory(Arc::new(factory))
    }

    /// Spawn a lifecycle task with a shared factory.
    pub fn with_factory(factory: Arc<dyn ClientFactory>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(LifecycleSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let task = LifecycleTask {
            factory,
            commands: commands.downgrade(),
            snapshot: snapshot_tx,
            events: events.clone(),
            state: LifecycleState::Uninitialised,
            config: None,
            address: None,
            client: None,
            monitor: ConnectionMonitor::new(),
            watchdog: ReconnectWatchdog::new(),
            registration: RegistrationManager::new(),
            initialised: false,
            reconnect_attempts: 0,
        };
        tokio::spawn(task.run(rx));

        Self {
            commands,
            snapshot,
            events,
        }
    }

    /// Create, subscribe and start a client for `config`.
    ///
    /// May be called again at any time; the previous client is replaced and
    /// its subscription removed. Fails without changing state when the
    /// client cannot be built or started.
    pub async fn initialise(&self, config: LifecycleConfig) -> Result<()> {
        config.validate()?;
        let address = resolve_address(&config.server).await;

        let (reply, rx) = oneshot::channel();
        self.send(Command::Initialise {
            config: Box::new(config),
            address,
            reply,
        })?;
        rx.await.map_err(|_| TetherError::Closed)?
    }

    /// Release client, descriptor and discovery handle without unregistering.
    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Close { reply })?;
        rx.await.map_err(|_| TetherError::Closed)
    }

    /// Remove the live registration from the coordination service.
    ///
    /// A no-op when nothing is registered.
    pub async fn deregister(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Deregister { reply })?;
        rx.await.map_err(|_| TetherError::Closed)?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| TetherError::Closed)
    }

    /// Current client handle.
    pub fn client(&self) -> Option<Arc<dyn CoordinationClient>> {
        self.snapshot.borrow().client.clone()
    }

    /// Current service instance descriptor.
    pub fn service_instance(&self) -> Option<ServiceInstance> {
        self.snapshot.borrow().instance.clone()
    }

    /// Current discovery handle.
    pub fn service_discovery(&self) -> Option<Arc<ServiceDiscovery>> {
        self.snapshot.borrow().discovery.clone()
    }

    /// Dependencies declared in the configuration.
    pub fn service_dependencies(&self) -> Vec<String> {
        self.snapshot.borrow().dependencies.clone()
    }

    /// Whether `initialise` has succeeded at least once.
    pub fn is_initialised(&self) -> bool {
        self.snapshot.borrow().initialised
    }

    /// Whether the process currently holds a live registration.
    pub fn is_registered_service(&self) -> bool {
        self.snapshot.borrow().is_registered()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.snapshot.borrow().state
    }

    /// Total watchdog reconnect attempts.
    pub fn reconnect_attempts(&self) -> u64 {
        self.snapshot.borrow().reconnect_attempts
    }

    /// Copy of the current snapshot.
    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Watch snapshot changes.
    pub fn watch(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until a live registration is visible and return its descriptor.
    pub async fn registered(&self) -> Result<ServiceInstance> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.is_registered() && s.instance.is_some())
            .await
            .map_err(|_| TetherError::Closed)?;
        snapshot
            .instance
            .clone()
            .ok_or_else(|| TetherError::InvalidState("registered without a descriptor".into()))
    }
}

impl std::fmt::Debug for ServiceLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceLifecycle")
            .field("snapshot", &*self.snapshot.borrow())
            .finish()
    }
}

/// Owner of every piece of lifecycle state.
struct LifecycleTask {
    factory: Arc<dyn ClientFactory>,
    commands: mpsc::WeakUnboundedSender<Command>,
    snapshot: watch::Sender<LifecycleSnapshot>,
    events: broadcast::Sender<LifecycleEvent>,
    state: LifecycleState,
    config: Option<LifecycleConfig>,
    address: Option<IpAddr>,
    client: Option<Arc<dyn CoordinationClient>>,
    monitor: ConnectionMonitor,
    watchdog: ReconnectWatchdog,
    registration: RegistrationManager,
    initialised: bool,
    reconnect_attempts: u64,
}

impl LifecycleTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Initialise {
                    config,
                    address,
                    reply,
                } => {
                    let result = self.initialise(*config, address).await;
                    let _ = reply.send(result);
                }
                Command::Signal { generation, signal } => {
                    self.handle_signal(generation, signal).await;
                }
                Command::WatchdogTick { generation } => {
                    if self.watchdog.is_current(generation) {
                        let _ = self.apply(LifecycleInput::WatchdogTick).await;
                    }
                }
                Command::Deregister { reply } => {
                    let result = self.deregister().await;
                    let _ = reply.send(result);
                }
                Command::Close { reply } => {
                    let _ = self.apply(LifecycleInput::Close).await;
                    tracing::info!("Service lifecycle closed");
                    let _ = reply.send(());
                }
            }
        }

        self.monitor.detach();
        self.watchdog.cancel();
        tracing::debug!("Service lifecycle task stopped");
    }

    async fn initialise(&mut self, config: LifecycleConfig, address: IpAddr) -> Result<()> {
        let previous_config = self.config.replace(config);
        let previous_address = self.address.replace(address);

        if let Err(e) = self.apply(LifecycleInput::Initialise).await {
            self.config = previous_config;
            self.address = previous_address;
            return Err(e);
        }

        self.initialised = true;
        self.reconnect_attempts = 0;
        self.publish();

        if let Some(config) = &self.config {
            tracing::info!(
                "Service lifecycle initialised for {} at {} via {}",
                config.service_name,
                address,
                config.zookeeper.connection_string
            );
        }
        Ok(())
    }

    async fn handle_signal(&mut self, generation: u64, signal: ClientSignal) {
        if !self.monitor.is_current(generation) {
            tracing::debug!("Dropping {} signal from stale client {}", signal, generation);
            return;
        }

        let input = match signal {
            ClientSignal::Connected => {
                if self.state.is_armed() {
                    tracing::info!("Connected to coordination service");
                }
                LifecycleInput::Connected
            }
            ClientSignal::Disconnected => {
                if self.state.is_armed() {
                    tracing::warn!("Disconnected from coordination service");
                }
                LifecycleInput::Disconnected
            }
        };
        let _ = self.apply(input).await;
    }

    async fn deregister(&mut self) -> Result<()> {
        let removed = self.registration.deregister().await?;
        if let Some(instance) = removed {
            tracing::info!(
                "Deregistered service {} ({})",
                instance.name,
                instance.id
            );
        }
        self.publish();
        Ok(())
    }

    /// Run the transition for `input`. On failure the previous state is
    /// restored.
    async fn apply(&mut self, input: LifecycleInput) -> Result<()> {
        let previous = self.state;
        let t = transition(previous, input);
        self.state = t.next;

        for effect in t.effects {
            if let Err(e) = self.run_effect(effect).await {
                self.state = previous;
                self.publish();
                return Err(e);
            }
        }

        if previous != self.state {
            tracing::debug!(
                "Lifecycle {} -> {} (registered: {}, stale: {}, monitor: {}, watchdog: {})",
                previous,
                self.state,
                self.registration.is_registered(),
                self.registration.stale_count(),
                self.monitor.is_attached(),
                self.watchdog.is_armed()
            );
        }
        self.publish();
        Ok(())
    }

    async fn run_effect(&mut self, effect: Effect) -> Result<()> {
        match effect {
            Effect::AttachClient => self.attach_client()?,
            Effect::InvalidateRegistration => self.registration.invalidate(),
            Effect::UnregisterStale => self.unregister_stale().await,
            Effect::CancelWatchdog => {
                self.watchdog.cancel();
            }
            Effect::StartWatchdog => {
                if let Some(config) = &self.config {
                    self.watchdog
                        .start(config.watchdog.interval(), self.commands.clone());
                }
            }
            Effect::Register => self.register().await,
            Effect::Reconnect => self.reconnect(),
            Effect::EmitConnected => self.emit(LifecycleEvent::Connected),
            Effect::EmitDisconnected => self.emit(LifecycleEvent::Disconnected),
            Effect::Release => {
                self.monitor.detach();
                self.client = None;
                self.registration.release();
            }
        }
        Ok(())
    }

    /// Build, subscribe and start a client, then retire the previous one.
    fn attach_client(&mut self) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| TetherError::InvalidState("lifecycle has no configuration".into()))?;

        let client = self.factory.new_client(
            &config.zookeeper.connection_string,
            config.zookeeper.retry.count,
        )?;
        let signals = client.signals();
        if let Err(e) = client.start() {
            client.close();
            return Err(e);
        }

        self.monitor.attach(signals, self.commands.clone());
        if let Some(old) = self.client.replace(client) {
            old.close();
        }
        Ok(())
    }

    fn reconnect(&mut self) {
        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;

        if let Some(config) = &self.config {
            tracing::info!(
                "Reconnecting to {} (attempt {})",
                config.zookeeper.connection_string,
                attempt
            );
        }
        self.emit(LifecycleEvent::Reconnecting { attempt });

        if let Err(e) = self.attach_client() {
            tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
        }
    }

    async fn unregister_stale(&mut self) {
        let (Some(client), Some(config)) = (&self.client, &self.config) else {
            return;
        };
        self.registration
            .unregister_stale(client, config.watchdog.unregister_timeout(), config.debug)
            .await;
    }

    async fn register(&mut self) {
        let (Some(client), Some(config), Some(address)) =
            (self.client.clone(), self.config.as_ref(), self.address)
        else {
            return;
        };

        match self.registration.register(&client, config, address).await {
            Ok(instance) => {
                tracing::info!(
                    "Registered service {} at {} ({})",
                    instance.name,
                    instance.endpoint(),
                    instance.id
                );
                self.publish();
                self.emit(LifecycleEvent::Ready(instance));
            }
            Err(e) => {
                tracing::error!("Failed to register service {}: {}", config.service_name, e);
                self.publish();
                self.emit(LifecycleEvent::RegistrationFailed(e.to_string()));
            }
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.publish();
        tracing::trace!("Lifecycle event {}", event.as_str());
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(LifecycleSnapshot {
            state: self.state,
            initialised: self.initialised,
            client: self.client.clone(),
            instance: self.registration.instance().cloned(),
            discovery: self.registration.discovery().cloned(),
            dependencies: self
                .config
                .as_ref()
                .map(|c| c.service_dependencies.clone())
                .unwrap_or_default(),
            reconnect_attempts: self.reconnect_attempts,
        });
    }
}
