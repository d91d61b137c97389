//! etcd coordination backend.
//!
//! A lease plays the part of the session: registrations are written with the
//! lease attached, so they disappear when keep-alive stops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use etcd_client::{Client, LeaseKeepAliveStream, LeaseKeeper, PutOptions};
use futures::future::BoxFuture;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use tether_core::config::ZookeeperConfig;
use tether_core::discovery::{ClientFactory, ClientSignal, CoordinationClient, ServiceInstance};
use tether_core::{Result, TetherError};

/// Default lease TTL in seconds.
pub const DEFAULT_LEASE_TTL: i64 = 10;

/// First connect retry delay; doubles per attempt up to [`MAX_CONNECT_BACKOFF`].
///
/// The lifecycle watchdog replaces a client that has not connected once per
/// interval, so a factory given that interval shrinks the first delay until
/// every retry fits inside it.
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);
const MIN_CONNECT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct Session {
    client: Client,
    lease_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Idle,
    Started,
    Closed,
}

fn client_error(e: etcd_client::Error) -> TetherError {
    TetherError::Client(e.to_string())
}

/// [`CoordinationClient`] backed by an etcd cluster.
pub struct EtcdClient {
    connection_string: String,
    endpoints: Vec<String>,
    retry_count: u32,
    lease_ttl: i64,
    connect_backoff: Duration,
    signal_tx: broadcast::Sender<ClientSignal>,
    session: Arc<watch::Sender<Option<Session>>>,
    status: watch::Sender<Status>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdClient {
    /// Build a client for a comma-separated endpoint list.
    pub fn new(connection_string: &str, retry_count: u32, lease_ttl: i64) -> Result<Self> {
        let endpoints = ZookeeperConfig::new(connection_string).endpoints();
        if endpoints.is_empty() {
            return Err(TetherError::Config(format!(
                "no etcd endpoints in '{}'",
                connection_string
            )));
        }
        if lease_ttl <= 0 {
            return Err(TetherError::Config("lease TTL must be positive".into()));
        }

        let (signal_tx, _) = broadcast::channel(16);
        let (session, _) = watch::channel(None);
        let (status, _) = watch::channel(Status::Idle);

        Ok(Self {
            connection_string: connection_string.to_string(),
            endpoints,
            retry_count,
            lease_ttl,
            connect_backoff: CONNECT_BACKOFF,
            signal_tx,
            session: Arc::new(session),
            status,
            task: Mutex::new(None),
        })
    }

    /// Override the first connect retry delay.
    pub fn with_connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    /// Endpoints this client connects to.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Lease id of the current session.
    pub fn lease_id(&self) -> Option<i64> {
        self.session.borrow().as_ref().map(|s| s.lease_id)
    }

    fn current_session(&self) -> Result<Session> {
        self.session.borrow().clone().ok_or_else(|| {
            TetherError::Connection(format!("not connected to {}", self.connection_string))
        })
    }

    fn abort_task(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

impl CoordinationClient for EtcdClient {
    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    fn start(&self) -> Result<()> {
        match *self.status.borrow() {
            Status::Closed => {
                return Err(TetherError::Client(format!(
                    "client for {} is closed",
                    self.connection_string
                )))
            }
            Status::Started => return Ok(()),
            Status::Idle => {}
        }
        self.status.send_replace(Status::Started);

        let endpoints = self.endpoints.clone();
        let attempts = self.retry_count + 1;
        let backoff = self.connect_backoff;
        let lease_ttl = self.lease_ttl;
        let session = self.session.clone();
        let signal_tx = self.signal_tx.clone();

        let task = tokio::spawn(async move {
            let (client, lease_id, keeper, stream) =
                match open_session(&endpoints, attempts, backoff, lease_ttl).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        tracing::warn!("Failed to connect to etcd: {}", e);
                        let _ = signal_tx.send(ClientSignal::Disconnected);
                        return;
                    }
                };

            tracing::debug!("etcd session established with lease {}", lease_id);
            session.send_replace(Some(Session { client, lease_id }));
            let _ = signal_tx.send(ClientSignal::Connected);

            keep_alive(keeper, stream, lease_id, lease_ttl).await;

            session.send_replace(None);
            let _ = signal_tx.send(ClientSignal::Disconnected);
        });

        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        Ok(())
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
            let Session {
                mut client,
                lease_id,
            } = self.current_session()?;
            let value = serde_json::to_vec(instance)?;

            client
                .put(path, value, Some(PutOptions::new().with_lease(lease_id)))
                .await
                .map_err(client_error)?;
            Ok(())
        })
    }

    fn unregister<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Session { mut client, .. } = self.current_session()?;
            let resp = client.delete(path, None).await.map_err(client_error)?;
            if resp.deleted() == 0 {
                return Err(TetherError::NotFound(path.to_string()));
            }
            Ok(())
        })
    }

    fn close(&self) {
        if self.status.send_replace(Status::Closed) == Status::Closed {
            return;
        }
        self.abort_task();

        // Revoking the lease removes every entry written under it.
        if let Some(Session {
            mut client,
            lease_id,
        }) = self.session.send_replace(None)
        {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = client.lease_revoke(lease_id).await {
                        tracing::debug!("Failed to revoke lease {}: {}", lease_id, e);
                    }
                });
            }
        }
    }
}

impl Drop for EtcdClient {
    fn drop(&mut self) {
        self.abort_task();
    }
}

/// Connect, grant a lease and open its keep-alive stream.
async fn open_session(
    endpoints: &[String],
    attempts: u32,
    backoff: Duration,
    lease_ttl: i64,
) -> Result<(Client, i64, LeaseKeeper, LeaseKeepAliveStream)> {
    let mut client = connect(endpoints, attempts, backoff).await?;

    let lease = client
        .lease_grant(lease_ttl, None)
        .await
        .map_err(client_error)?;
    let lease_id = lease.id();

    let (keeper, stream) = client
        .lease_keep_alive(lease_id)
        .await
        .map_err(client_error)?;

    Ok((client, lease_id, keeper, stream))
}

async fn connect(endpoints: &[String], attempts: u32, base: Duration) -> Result<Client> {
    let mut attempt = 1;

    loop {
        match Client::connect(endpoints, None).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < attempts => {
                tracing::debug!(
                    "etcd connection attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    e
                );
                tokio::time::sleep(connect_backoff(base, attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(TetherError::Connection(format!(
                    "failed to connect after {} attempts: {}",
                    attempts, e
                )))
            }
        }
    }
}

/// Refresh the lease until keep-alive fails.
async fn keep_alive(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    lease_ttl: i64,
) {
    let mut interval = tokio::time::interval(keep_alive_interval(lease_ttl));
    interval.tick().await; // Skip first immediate tick

    loop {
        interval.tick().await;

        if let Err(e) = keeper.keep_alive().await {
            tracing::warn!("Keep-alive send failed for lease {}: {}", lease_id, e);
            break;
        }

        match stream.message().await {
            Ok(Some(resp)) if resp.ttl() > 0 => {
                tracing::trace!("Keep-alive OK for lease {}, ttl {}", lease_id, resp.ttl());
            }
            Ok(Some(_)) => {
                tracing::warn!("Lease {} expired", lease_id);
                break;
            }
            Ok(None) => {
                tracing::warn!("Keep-alive stream closed for lease {}", lease_id);
                break;
            }
            Err(e) => {
                tracing::warn!("Keep-alive failed for lease {}: {}", lease_id, e);
                break;
            }
        }
    }
}

/// Delay after failed attempt `attempt` (1-based).
fn connect_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(MAX_CONNECT_BACKOFF)
}

/// Largest first delay whose doubling schedule for `retry_count` retries
/// completes within `window`.
fn backoff_within(window: Duration, retry_count: u32) -> Duration {
    if retry_count == 0 {
        return CONNECT_BACKOFF;
    }
    let slots = (1u32 << retry_count.min(16)) - 1;
    (window / slots).clamp(MIN_CONNECT_BACKOFF, CONNECT_BACKOFF)
}

fn keep_alive_interval(lease_ttl: i64) -> Duration {
    let millis = (lease_ttl.max(1) as u64 * 1000) / 3;
    Duration::from_millis(millis.max(100))
}

/// [`ClientFactory`] producing [`EtcdClient`]s.
#[derive(Debug, Clone)]
pub struct EtcdClientFactory {
    lease_ttl: i64,
    retry_window: Option<Duration>,
}

impl EtcdClientFactory {
    /// Factory using the default lease TTL.
    pub fn new() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            retry_window: None,
        }
    }

    /// Override the lease TTL in seconds.
    pub fn with_lease_ttl(mut self, lease_ttl: i64) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Fit each client's connect retries into `window`, usually the
    /// watchdog interval.
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = Some(window);
        self
    }
}

impl Default for EtcdClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientFactory for EtcdClientFactory {
    fn new_client(
        &self,
        connection_string: &str,
        retry_count: u32,
    ) -> Result<Arc<dyn CoordinationClient>> {
        let mut client = EtcdClient::new(connection_string, retry_count, self.lease_ttl)?;
        if let Some(window) = self.retry_window {
            client = client.with_connect_backoff(backoff_within(window, retry_count));
        }
        Ok(Arc::new(client))
    }
}
