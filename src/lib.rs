//! Switch connection and mastership core for a clustered SDN controller.
//!
//! Accepts switch connections, runs each through the handshake, arbitrates
//! per-switch mastership against a cluster registry and fans messages and
//! lifecycle events out to application listeners. The binary entry point
//! is `src/main.rs`.

pub mod bootstrap;
pub mod controller;
pub mod core;
pub mod dispatch;
pub mod events;
pub mod handshake;
pub mod mastership;
pub mod protocol;
pub mod switch;
pub mod transport;

pub use crate::core::{config, error};
pub use controller::{Controller, ControllerSettings};
