use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_core::discovery::ClientSignal;

use super::command::Command;

/// Forwards one client's signals into the lifecycle command queue.
///
/// At most one forwarder exists at a time. Attaching to a new client aborts
/// the previous forwarder and bumps the generation, so signals still in
/// flight from the old client are recognisably stale.
pub(crate) struct ConnectionMonitor {
    forwarder: Option<JoinHandle<()>>,
    generation: u64,
}

impl ConnectionMonitor {
    /// Create a detached monitor.
    pub fn new() -> Self {
        Self {
            forwarder: None,
            generation: 0,
        }
    }

    /// Forward `signals` from now on. Returns the new generation.
    pub fn attach(
        &mut self,
        mut signals: broadcast::Receiver<ClientSignal>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> u64 {
        self.detach();
        self.generation += 1;
        let generation = self.generation;

        self.forwarder = Some(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => {
                        let Some(tx) = commands.upgrade() else {
                            break;
                        };
                        if tx.send(Command::Signal { generation, signal }).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "Connection monitor {} lagged, {} signals skipped",
                            generation,
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        generation
    }

    /// Stop forwarding.
    pub fn detach(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    /// Whether a signal from `generation` comes from the attached client.
    pub fn is_current(&self, generation: u64) -> bool {
        self.forwarder.is_some() && generation == self.generation
    }

    /// Whether a forwarder is attached.
    pub fn is_attached(&self) -> bool {
        self.forwarder.is_some()
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.detach();
    }
}
