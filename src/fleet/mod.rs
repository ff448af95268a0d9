//! Instrument fleet: discovery, identification and per-device command queues

pub mod probe;
pub mod supervisor;
pub mod worker;

pub use supervisor::{FleetError, FleetSupervisor};
pub use worker::QueuedCommand;
