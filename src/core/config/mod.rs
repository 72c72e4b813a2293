//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `TRELLIS_LOG_LEVEL` and `TRELLIS_LISTEN` env overrides.
//!
//! # Module layout
//!
//! - **types**: resolved structs consumed by the controller (`Config`,
//!   `OpenFlowConfig`, `MastershipConfig`, `EventsConfig`).
//! - **raw**: TOML deserialization shapes with serde defaults; private.
//! - **load**: `load`, `load_from`, `expand_home`, base-chain merging.

mod load;
mod raw;
mod types;

pub use load::{expand_home, load, load_from};
pub use types::*;

#[cfg(test)]
impl Config {
    /// Fast timers and a fixed identity for unit tests.
    pub fn test_default() -> Self {
        Self {
            controller_id: "test-controller".into(),
            log_level: "debug".into(),
            log_file: None,
            openflow: OpenFlowConfig {
                listen: "127.0.0.1:0".into(),
                idle_timeout: std::time::Duration::from_millis(200),
                read_timeout: std::time::Duration::from_secs(2),
                handshake_timeout: std::time::Duration::from_secs(2),
                inbound_queue: 16,
            },
            mastership: MastershipConfig {
                role_support: true,
                local_role: crate::protocol::Role::Master,
                always_clear_flows: false,
                role_request_timeout: None,
                control_request_retry_yield: std::time::Duration::from_millis(1),
            },
            events: EventsConfig { queue_capacity: 0 },
        }
    }
}
