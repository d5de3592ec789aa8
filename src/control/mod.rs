//! The control plane (spec §4.7, §6): an HTTP+WebSocket surface for
//! external peers to send COMMANDs and observe NOTIFY/DASHBOARD events,
//! plus an optional UDP OSC mirror of DASHBOARD events.

pub mod event_bus;
pub mod message;
pub mod osc;
pub mod server;

pub use event_bus::EventBus;
pub use message::{ControlMessage, ControlRequest};
