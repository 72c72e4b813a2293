//! Mastership arbitration.
//!
//! - **registry**: the external coordination service, behind
//!   [`MastershipRegistry`]. [`LocalRegistry`] is the single-node stand-in.
//! - **arbiter**: turns READY switches, registry callbacks and role
//!   replies into changes of the active view.
//! - **role_changer**: sends role requests and tracks them per switch.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::SwitchId;

pub mod arbiter;
pub mod local;
pub mod role_changer;

pub use arbiter::{Arbiter, ReadyOutcome, RoleErrorOutcome};
pub use local::LocalRegistry;
pub use role_changer::{RoleChanger, RoleRequest, SubmitOutcome};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("controller {0} already registered")]
    AlreadyRegistered(String),
}

/// Told when this instance gains or loses control of a switch. Invoked on
/// the registry's own task, never from inside `request_control`.
pub trait ControlChangeCallback: Send + Sync {
    fn control_changed(&self, id: SwitchId, has_control: bool);
}

/// Cluster-wide leadership per switch identity.
pub trait MastershipRegistry: Send + Sync {
    fn register_controller(&self, controller_id: &str) -> Result<(), RegistryError>;

    /// Enter the contest for `id`. Outcome arrives later through `callback`.
    fn request_control(
        &self,
        id: SwitchId,
        callback: Arc<dyn ControlChangeCallback>,
    ) -> Result<(), RegistryError>;

    fn release_control(&self, id: SwitchId);

    fn has_control(&self, id: SwitchId) -> bool;

    /// Controller currently holding `id`, if any.
    fn controller_for_switch(&self, id: SwitchId) -> Result<Option<String>, RegistryError>;
}
