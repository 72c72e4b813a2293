//! Single-node mastership registry.
//!
//! Grants control to whoever asks first (optionally right away) and lets
//! tests or operators flip control with [`LocalRegistry::grant`] and
//! [`LocalRegistry::revoke`]. Callbacks are delivered in order from a
//! background task, so `request_control` never re-enters the caller.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::SwitchId;

use super::{ControlChangeCallback, MastershipRegistry, RegistryError};

struct Contest {
    callback: Arc<dyn ControlChangeCallback>,
    has_control: bool,
}

type Notice = (Arc<dyn ControlChangeCallback>, SwitchId, bool);

pub struct LocalRegistry {
    controller_id: Mutex<Option<String>>,
    contests: Mutex<HashMap<SwitchId, Contest>>,
    grant_on_request: bool,
    notify_tx: mpsc::UnboundedSender<Notice>,
}

impl LocalRegistry {
    /// Must be called inside a Tokio runtime; spawns the notifier task.
    pub fn new(grant_on_request: bool) -> Arc<Self> {
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Notice>();
        tokio::spawn(async move {
            while let Some((callback, id, has_control)) = notify_rx.recv().await {
                callback.control_changed(id, has_control);
            }
        });
        Arc::new(Self {
            controller_id: Mutex::new(None),
            contests: Mutex::new(HashMap::new()),
            grant_on_request,
            notify_tx,
        })
    }

    fn set_control(&self, id: SwitchId, has_control: bool) -> bool {
        let mut contests = self.contests.lock();
        let Some(contest) = contests.get_mut(&id) else {
            return false;
        };
        contest.has_control = has_control;
        let _ = self
            .notify_tx
            .send((contest.callback.clone(), id, has_control));
        true
    }

    /// Hand control of `id` to this node. False if nobody asked for it.
    pub fn grant(&self, id: SwitchId) -> bool {
        info!(dpid = %id, "granting control");
        self.set_control(id, true)
    }

    pub fn revoke(&self, id: SwitchId) -> bool {
        info!(dpid = %id, "revoking control");
        self.set_control(id, false)
    }
}

impl MastershipRegistry for LocalRegistry {
    fn register_controller(&self, controller_id: &str) -> Result<(), RegistryError> {
        let mut current = self.controller_id.lock();
        match current.as_deref() {
            Some(existing) if existing != controller_id => {
                Err(RegistryError::AlreadyRegistered(existing.to_string()))
            }
            _ => {
                *current = Some(controller_id.to_string());
                Ok(())
            }
        }
    }

    fn request_control(
        &self,
        id: SwitchId,
        callback: Arc<dyn ControlChangeCallback>,
    ) -> Result<(), RegistryError> {
        let mut contests = self.contests.lock();
        let has_control = match contests.get_mut(&id) {
            // A reconnecting switch takes over the standing request.
            Some(contest) => {
                debug!(dpid = %id, has_control = contest.has_control, "control re-requested");
                contest.callback = callback.clone();
                contest.has_control
            }
            None => {
                debug!(dpid = %id, "control requested");
                contests.insert(
                    id,
                    Contest {
                        callback: callback.clone(),
                        has_control: self.grant_on_request,
                    },
                );
                self.grant_on_request
            }
        };
        if has_control {
            let _ = self.notify_tx.send((callback, id, true));
        }
        Ok(())
    }

    fn release_control(&self, id: SwitchId) {
        if self.contests.lock().remove(&id).is_some() {
            debug!(dpid = %id, "control released");
        }
    }

    fn has_control(&self, id: SwitchId) -> bool {
        self.contests
            .lock()
            .get(&id)
            .is_some_and(|c| c.has_control)
    }

    fn controller_for_switch(&self, id: SwitchId) -> Result<Option<String>, RegistryError> {
        if !self.has_control(id) {
            return Ok(None);
        }
        Ok(self.controller_id.lock().clone())
    }
}
