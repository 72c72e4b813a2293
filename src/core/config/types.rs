//! Public configuration types.
//!
//! These are the resolved structs the controller consumes. Raw TOML
//! deserialization types live in `raw.rs`.

use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::Role;

// ── Transport ───────────────────────────────────────────────────────────────

/// Switch-facing listener and per-connection timers.
#[derive(Debug, Clone)]
pub struct OpenFlowConfig {
    /// Socket address the switch listener binds to.
    pub listen: String,
    /// Read-idle interval after which an ECHO_REQUEST probe is sent.
    pub idle_timeout: Duration,
    /// Silence after which the connection is dropped with a read timeout.
    pub read_timeout: Duration,
    /// Budget for a connection to go from connect to READY.
    pub handshake_timeout: Duration,
    /// Capacity of the per-connection inbound queue. Overflow drops messages.
    pub inbound_queue: usize,
}

// ── Mastership ──────────────────────────────────────────────────────────────

/// Role arbitration behaviour.
#[derive(Debug, Clone)]
pub struct MastershipConfig {
    /// When false, role messages are never sent and every READY switch is
    /// promoted straight into the active view.
    pub role_support: bool,
    /// Role this instance starts from when arbitration is enabled.
    pub local_role: Role,
    /// Clear a switch's flow table on every promotion, not only the first.
    pub always_clear_flows: bool,
    /// Close connections whose oldest role request is older than this.
    /// `None` leaves outstanding requests alone.
    pub role_request_timeout: Option<Duration>,
    /// Pause before closing a connection whose control request failed.
    pub control_request_retry_yield: Duration,
}

// ── Events ──────────────────────────────────────────────────────────────────

/// Lifecycle event queue sizing.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// `0` means unbounded.
    pub queue_capacity: usize,
}

// ── Top-level ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    /// Identity this instance registers with the mastership registry.
    pub controller_id: String,
    pub log_level: String,
    /// Optional log file. Logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
    pub openflow: OpenFlowConfig,
    pub mastership: MastershipConfig,
    pub events: EventsConfig,
}
