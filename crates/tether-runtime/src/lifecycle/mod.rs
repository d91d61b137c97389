//! Connection lifecycle of a registered service.
//!
//! A single task owns the client, the registration and the watchdog. Client
//! signals and watchdog ticks reach it through one command queue and drive
//! the state machine in [`state`].

mod command;
mod events;
mod monitor;
mod registration;
mod resolve;
mod service;
pub mod state;
mod watchdog;

pub use events::LifecycleEvent;
pub use resolve::{current_port, resolve_address, resolve_port, PORT_ENV};
pub use service::{LifecycleSnapshot, ServiceLifecycle};
pub use state::{LifecycleInput, LifecycleState};
