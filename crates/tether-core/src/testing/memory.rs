//! In-memory coordination service.
//!
//! Simulates sessions, ephemeral entries and connection signals so the
//! lifecycle can be driven deterministically. Every client operation is
//! recorded for ordering assertions.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::discovery::{ClientFactory, ClientSignal, CoordinationClient, ServiceInstance};
use crate::error::{Result, TetherError};

/// Operation observed by the ensemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    /// A client was constructed.
    ClientCreated { client: u64 },
    /// A client established a session.
    Connect { client: u64, session: u64 },
    /// A client lost its session.
    Disconnect { client: u64 },
    /// An entry was published.
    Register { path: String },
    /// An entry removal was attempted.
    Unregister { path: String },
    /// A client was closed.
    Close { client: u64 },
}

#[derive(Debug, Clone)]
struct Entry {
    instance: ServiceInstance,
    session: u64,
}

#[derive(Default)]
struct EnsembleState {
    offline: bool,
    next_client: u64,
    next_session: u64,
    entries: BTreeMap<String, Entry>,
    ops: Vec<RecordedOp>,
    clients: Vec<Weak<MemoryClient>>,
    reject_register: bool,
    reject_unregister: bool,
    stall_unregister: bool,
    fail_construction: bool,
}

impl EnsembleState {
    fn live_clients(&self) -> Vec<Arc<MemoryClient>> {
        self.clients.iter().filter_map(Weak::upgrade).collect()
    }

    fn open_session(&mut self, client: &MemoryClient, status: &mut ClientStatus) {
        self.next_session += 1;
        let session = self.next_session;
        *status = ClientStatus::Connected { session };
        self.ops.push(RecordedOp::Connect {
            client: client.id,
            session,
        });
        let _ = client.signal_tx.send(ClientSignal::Connected);
    }
}

/// Shared in-memory coordination service.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl MemoryEnsemble {
    /// Create an online ensemble.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory producing clients of this ensemble.
    pub fn factory(&self) -> MemoryClientFactory {
        MemoryClientFactory {
            ensemble: self.clone(),
        }
    }

    /// Build a client that has not been started.
    pub fn client(&self, connection_string: &str) -> Arc<dyn CoordinationClient> {
        self.new_client(connection_string, 0)
    }

    /// Build and start a client. Connected when the ensemble is online.
    pub fn connected_client(&self, connection_string: &str) -> Arc<dyn CoordinationClient> {
        let client = self.new_client(connection_string, 0);
        client.start().unwrap();
        client
    }

    fn new_client(&self, connection_string: &str, retry_count: u32) -> Arc<MemoryClient> {
        let mut state = self.state.lock().unwrap();
        state.next_client += 1;
        let id = state.next_client;

        let (signal_tx, _) = broadcast::channel(16);
        let client = Arc::new(MemoryClient {
            id,
            connection_string: connection_string.to_string(),
            retry_count,
            state: self.state.clone(),
            signal_tx,
            status: Mutex::new(ClientStatus::Idle),
        });

        state.clients.push(Arc::downgrade(&client));
        state.ops.push(RecordedOp::ClientCreated { client: id });
        client
    }

    /// Drop every session's connection. Entries stay until cleaned up.
    pub fn go_offline(&self) {
        let mut state = self.state.lock().unwrap();
        state.offline = true;

        for client in state.live_clients() {
            let mut status = client.status.lock().unwrap();
            if let ClientStatus::Connected { .. } = *status {
                *status = ClientStatus::Pending;
                state.ops.push(RecordedOp::Disconnect { client: client.id });
                let _ = client.signal_tx.send(ClientSignal::Disconnected);
            }
        }
    }

    /// Come back online. Started clients that are still waiting connect now.
    pub fn go_online(&self) {
        let mut state = self.state.lock().unwrap();
        state.offline = false;

        for client in state.live_clients() {
            let mut status = client.status.lock().unwrap();
            if let ClientStatus::Pending = *status {
                state.open_session(&client, &mut status);
            }
        }
    }

    /// Whether clients can connect.
    pub fn is_online(&self) -> bool {
        !self.state.lock().unwrap().offline
    }

    /// Make every register call fail.
    pub fn reject_register(&self, reject: bool) {
        self.state.lock().unwrap().reject_register = reject;
    }

    /// Make every unregister call fail.
    pub fn reject_unregister(&self, reject: bool) {
        self.state.lock().unwrap().reject_unregister = reject;
    }

    /// Make every unregister call hang after it is recorded.
    pub fn stall_unregister(&self, stall: bool) {
        self.state.lock().unwrap().stall_unregister = stall;
    }

    /// Make client construction fail.
    pub fn fail_client_construction(&self, fail: bool) {
        self.state.lock().unwrap().fail_construction = fail;
    }

    /// Number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Stored entries keyed by path.
    pub fn entries(&self) -> Vec<(String, ServiceInstance)> {
        self.state
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.instance.clone()))
            .collect()
    }

    /// All recorded operations, oldest first.
    pub fn ops(&self) -> Vec<RecordedOp> {
        self.state.lock().unwrap().ops.clone()
    }

    /// Number of clients constructed so far.
    pub fn clients_created(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| matches!(op, RecordedOp::ClientCreated { .. }))
            .count()
    }

    /// Most recently constructed client that is still alive.
    pub fn latest_client(&self) -> Option<Arc<MemoryClient>> {
        self.state
            .lock()
            .unwrap()
            .clients
            .iter()
            .rev()
            .find_map(Weak::upgrade)
    }

    /// Paths that were registered, in order.
    pub fn registered_paths(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                RecordedOp::Register { path } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Paths whose removal was attempted, in order.
    pub fn unregistered_paths(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                RecordedOp::Unregister { path } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Assert that `path` was unregistered before any later registration.
    pub fn assert_unregistered_before_next_register(&self, path: &str) {
        let ops = self.ops();
        let unregister_at = ops
            .iter()
            .position(|op| matches!(op, RecordedOp::Unregister { path: p } if p == path))
            .unwrap_or_else(|| panic!("Expected '{}' to be unregistered, ops: {:?}", path, ops));
        let registered_at = ops
            .iter()
            .position(|op| matches!(op, RecordedOp::Register { path: p } if p == path))
            .unwrap_or_else(|| panic!("Expected '{}' to have been registered", path));

        let next_register = ops
            .iter()
            .enumerate()
            .skip(registered_at + 1)
            .find(|(_, op)| matches!(op, RecordedOp::Register { .. }))
            .map(|(i, _)| i);

        if let Some(next) = next_register {
            assert!(
                unregister_at < next,
                "Expected '{}' to be unregistered before the next registration, ops: {:?}",
                path,
                ops
            );
        }
    }

    /// Assert that no removal was ever attempted.
    pub fn assert_no_unregister(&self) {
        let removed = self.unregistered_paths();
        assert!(
            removed.is_empty(),
            "Expected no unregister calls, but saw: {:?}",
            removed
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientStatus {
    Idle,
    Pending,
    Connected { session: u64 },
    Closed,
}

/// Client of a [`MemoryEnsemble`].
pub struct MemoryClient {
    id: u64,
    connection_string: String,
    retry_count: u32,
    state: Arc<Mutex<EnsembleState>>,
    signal_tx: broadcast::Sender<ClientSignal>,
    status: Mutex<ClientStatus>,
}

impl MemoryClient {
    /// Client number within the ensemble.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Retry ceiling the client was built with.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        *self.status.lock().unwrap() == ClientStatus::Closed
    }

    /// Whether the client holds a session.
    pub fn is_connected(&self) -> bool {
        self.session().is_ok()
    }

    /// Push a raw signal to subscribers without touching the session.
    pub fn emit(&self, signal: ClientSignal) -> usize {
        self.signal_tx.send(signal).unwrap_or(0)
    }

    /// Number of live signal subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.signal_tx.receiver_count()
    }

    fn session(&self) -> Result<u64> {
        match *self.status.lock().unwrap() {
            ClientStatus::Connected { session } => Ok(session),
            _ => Err(TetherError::Connection(format!(
                "client {} is not connected",
                self.id
            ))),
        }
    }
}

impl CoordinationClient for MemoryClient {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let mut status = self.status.lock().unwrap();

        match *status {
            ClientStatus::Closed => Err(TetherError::Client(format!(
                "client {} is closed",
                self.id
            ))),
            ClientStatus::Connected { .. } | ClientStatus::Pending => Ok(()),
            ClientStatus::Idle => {
                *status = ClientStatus::Pending;
                if !state.offline {
                    state.open_session(self, &mut status);
                }
                Ok(())
            }
        }
    }

    fn signals(&self) -> broadcast::Receiver<ClientSignal> {
        self.signal_tx.subscribe()
    }

    fn register<'a>(
        &'a self,
        path: &'a str,
        instance: &'a ServiceInstance,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let session = self.session()?;
            let mut state = self.state.lock().unwrap();
            if state.reject_register {
                return Err(TetherError::Registration(format!(
                    "register of {} rejected",
                    path
                )));
            }

            state.entries.insert(
                path.to_string(),
                Entry {
                    instance: instance.clone(),
                    session,
                },
            );
            state.ops.push(RecordedOp::Register {
                path: path.to_string(),
            });
            Ok(())
        })
    }

    fn unregister<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.session()?;
            let stall = {
                let mut state = self.state.lock().unwrap();
                state.ops.push(RecordedOp::Unregister {
                    path: path.to_string(),
                });
                if state.reject_unregister {
                    return Err(TetherError::Client(format!(
                        "unregister of {} rejected",
                        path
                    )));
                }
                state.stall_unregister
            };

            if stall {
                futures::future::pending::<()>().await;
            }

            match self.state.lock().unwrap().entries.remove(path) {
                Some(_) => Ok(()),
                None => Err(TetherError::NotFound(path.to_string())),
            }
        })
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        let mut status = self.status.lock().unwrap();

        if let ClientStatus::Connected { session } = *status {
            // Session end removes its ephemeral entries.
            state.entries.retain(|_, entry| entry.session != session);
        }
        if *status != ClientStatus::Closed {
            *status = ClientStatus::Closed;
            state.ops.push(RecordedOp::Close { client: self.id });
        }
    }
}

/// [`ClientFactory`] backed by a [`MemoryEnsemble`].
#[derive(Clone)]
pub struct MemoryClientFactory {
    ensemble: MemoryEnsemble,
}

impl MemoryClientFactory {
    /// The ensemble clients are created in.
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }
}

impl ClientFactory for MemoryClientFactory {
    fn new_client(
        &self,
        connection_string: &str,
        retry_count: u32,
    ) -> Result<Arc<dyn CoordinationClient>> {
        if self.ensemble.state.lock().unwrap().fail_construction {
            return Err(TetherError::Client(format!(
                "cannot create client for {}",
                connection_string
            )));
        }
        let client: Arc<dyn CoordinationClient> =
            self.ensemble.new_client(connection_string, retry_count);
        Ok(client)
    }
}
