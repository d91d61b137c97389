use std::net::IpAddr;

use tokio::sync::oneshot;

use tether_core::config::LifecycleConfig;
use tether_core::discovery::ClientSignal;
use tether_core::Result;

/// Command processed by the lifecycle task.
///
/// The task is the queue's only reader. Signals and ticks carry the
/// generation of the client or timer that produced them.
pub(crate) enum Command {
    Initialise {
        config: Box<LifecycleConfig>,
        address: IpAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    Signal {
        generation: u64,
        signal: ClientSignal,
    },
    WatchdogTick {
        generation: u64,
    },
    Deregister {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}
