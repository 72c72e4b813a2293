//! The *active* view: switches this instance masters, one record per
//! identity.
//!
//! `add_switch` and `remove_switch` must be called with the arbitration
//! lock held. Lookups are lock-free.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::events::{ControllerEvent, EventSender, SwitchListeners};
use crate::protocol::{PortDesc, PortReason, SwitchId};

use super::SwitchHandle;

/// Told about a new or re-enabled port before listeners hear of it, so
/// link discovery on that port can be held back until the topology side
/// has caught up.
pub trait PortDiscoveryHook: Send + Sync {
    fn suppress_discovery(&self, id: SwitchId, port: u16);
}

pub struct SwitchTable {
    active: DashMap<SwitchId, SwitchHandle>,
    events: EventSender,
    listeners: SwitchListeners,
    discovery: RwLock<Option<Arc<dyn PortDiscoveryHook>>>,
}

impl SwitchTable {
    pub fn new(events: EventSender, listeners: SwitchListeners) -> Self {
        Self {
            active: DashMap::new(),
            events,
            listeners,
            discovery: RwLock::new(None),
        }
    }

    pub fn set_discovery_hook(&self, hook: Option<Arc<dyn PortDiscoveryHook>>) {
        *self.discovery.write() = hook;
    }

    /// Put `sw` in the active view. An older record with the same identity
    /// is evicted first: its listeners are told synchronously, its pending
    /// statistics are cancelled and its connection is closed.
    pub fn add_switch(&self, sw: &SwitchHandle) {
        let previous = self.active.insert(sw.id(), sw.clone());
        match previous {
            Some(old) if Arc::ptr_eq(&old, sw) => {
                info!(switch = %sw, "switch already active; nothing to do");
                return;
            }
            Some(old) => {
                warn!(
                    dpid = %sw.id(),
                    old = %old.peer(),
                    new = %sw.peer(),
                    "new switch connection for an active identity; disconnecting the old one"
                );
                let _guard = old.listener_write();
                old.set_connected(false);
                old.cancel_all_statistics_replies();
                self.listeners.notify_removed(&old);
                old.close();
            }
            None => {}
        }
        info!(switch = %sw, "switch active");
        self.events.publish(ControllerEvent::SwitchAdded(sw.clone()));
    }

    /// Drop `sw` from the active view if that exact record is there and
    /// still connected. Returns whether a removal event was enqueued.
    pub fn remove_switch(&self, sw: &SwitchHandle) -> bool {
        let removed = self
            .active
            .remove_if(&sw.id(), |_, current| Arc::ptr_eq(current, sw))
            .is_some();
        if !removed || !sw.is_connected() {
            debug!(switch = %sw, "not removing switch; already removed or disconnected");
            return false;
        }
        sw.cancel_all_statistics_replies();
        info!(switch = %sw, "switch no longer active");
        self.events.publish(ControllerEvent::SwitchRemoved(sw.clone()));
        true
    }

    pub fn get(&self, id: SwitchId) -> Option<SwitchHandle> {
        self.active.get(&id).map(|e| e.value().clone())
    }

    pub fn contains(&self, id: SwitchId) -> bool {
        self.active.contains_key(&id)
    }

    /// Is this exact record the active one for its identity?
    pub fn is_active(&self, sw: &SwitchHandle) -> bool {
        self.active
            .get(&sw.id())
            .is_some_and(|e| Arc::ptr_eq(e.value(), sw))
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Active switches sorted by identity.
    pub fn snapshot(&self) -> Vec<SwitchHandle> {
        let mut all: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|sw| sw.id());
        all
    }

    /// Apply a PORT_STATUS to the record and, if the record is active,
    /// enqueue the matching port events.
    pub fn handle_port_status(&self, sw: &SwitchHandle, reason: PortReason, desc: PortDesc) {
        let id = sw.id();
        let event = match reason {
            PortReason::Add => {
                sw.set_port(desc.clone());
                ControllerEvent::PortAdded(id, desc)
            }
            PortReason::Modify => {
                sw.set_port(desc.clone());
                if desc.is_down() {
                    ControllerEvent::PortRemoved(id, desc)
                } else {
                    ControllerEvent::PortAdded(id, desc)
                }
            }
            PortReason::Delete => {
                sw.delete_port(desc.number);
                ControllerEvent::PortRemoved(id, desc)
            }
        };
        debug!(switch = %sw, ?reason, port = event_port(&event), "port status");
        if !self.is_active(sw) {
            debug!(switch = %sw, "port status for inactive switch; not publishing");
            return;
        }
        if let ControllerEvent::PortAdded(_, port) = &event {
            if let Some(hook) = self.discovery.read().as_ref() {
                hook.suppress_discovery(id, port.number);
            }
        }
        self.events.publish(event);
        self.events.publish(ControllerEvent::PortChanged(id));
    }
}

fn event_port(event: &ControllerEvent) -> u16 {
    match event {
        ControllerEvent::PortAdded(_, p) | ControllerEvent::PortRemoved(_, p) => p.number,
        _ => 0,
    }
}
