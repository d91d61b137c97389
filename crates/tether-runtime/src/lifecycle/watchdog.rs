use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::command::Command;

/// Periodic reconnection timer.
///
/// Ticks are delivered through the command queue rather than acted on here,
/// so reconnects are serialized with every other lifecycle mutation. A tick
/// already queued when the timer is cancelled no longer matches the current
/// generation and is dropped by the lifecycle task.
pub(crate) struct ReconnectWatchdog {
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl ReconnectWatchdog {
    /// Create an idle watchdog.
    pub fn new() -> Self {
        Self {
            timer: None,
            generation: 0,
        }
    }

    /// Arm a new timer firing every `interval`, replacing any existing one.
    pub fn start(&mut self, interval: Duration, commands: mpsc::WeakUnboundedSender<Command>) {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;

        self.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip first immediate tick

            loop {
                ticker.tick().await;

                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::WatchdogTick { generation }).is_err() {
                    break;
                }
            }
        }));
    }

    /// Cancel the running timer. Returns whether one was running.
    pub fn cancel(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a tick from `generation` belongs to the running timer.
    pub fn is_current(&self, generation: u64) -> bool {
        self.timer.is_some() && generation == self.generation
    }

    /// Whether a timer is running.
    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }
}

impl Drop for ReconnectWatchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
