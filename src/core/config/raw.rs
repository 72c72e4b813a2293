//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults, so an
//! empty file is a valid configuration. The `load` module converts them into
//! the public `types` structs.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub controller: RawController,
    #[serde(default)]
    pub openflow: RawOpenFlow,
    #[serde(default)]
    pub mastership: RawMastership,
    #[serde(default)]
    pub events: RawEvents,
}

#[derive(Deserialize)]
pub(super) struct RawController {
    #[serde(default)]
    pub controller_id: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for RawController {
    fn default() -> Self {
        Self {
            controller_id: None,
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

// ── Transport ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawOpenFlow {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

impl Default for RawOpenFlow {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            idle_timeout_secs: default_idle_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            inbound_queue: default_inbound_queue(),
        }
    }
}

// ── Mastership ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawMastership {
    #[serde(default = "default_true")]
    pub role_support: bool,
    #[serde(default = "default_local_role")]
    pub local_role: String,
    #[serde(default)]
    pub always_clear_flows: bool,
    /// `0` disables the sweep.
    #[serde(default)]
    pub role_request_timeout_ms: u64,
    #[serde(default = "default_retry_yield_ms")]
    pub control_request_retry_yield_ms: u64,
}

impl Default for RawMastership {
    fn default() -> Self {
        Self {
            role_support: true,
            local_role: default_local_role(),
            always_clear_flows: false,
            role_request_timeout_ms: 0,
            control_request_retry_yield_ms: default_retry_yield_ms(),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub(super) struct RawEvents {
    #[serde(default)]
    pub queue_capacity: usize,
}

// ── Defaults ────────────────────────────────────────────────────────────────

pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_listen() -> String {
    "0.0.0.0:6633".to_string()
}

pub(super) fn default_idle_timeout_secs() -> u64 {
    5
}

pub(super) fn default_read_timeout_secs() -> u64 {
    30
}

pub(super) fn default_handshake_timeout_secs() -> u64 {
    60
}

pub(super) fn default_inbound_queue() -> usize {
    256
}

pub(super) fn default_local_role() -> String {
    "master".to_string()
}

pub(super) fn default_retry_yield_ms() -> u64 {
    10
}
