//! Serializes everything that can move a switch in or out of the active
//! view: READY, registry callbacks, role replies and errors, port status,
//! disconnects.
//!
//! One mutex guards the connected set and is held across each of those
//! sequences. It is never held across an `.await`. The connected set keeps
//! every READY record, so an identity can briefly have more than one while
//! a switch reconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::handshake::Handshake;
use crate::protocol::{ErrorMsg, ErrorType, PortDesc, PortReason, Role, SwitchId, Xid};
use crate::switch::{SwitchHandle, SwitchTable};

use super::{
    ControlChangeCallback, MastershipRegistry, RegistryError, RoleChanger, SubmitOutcome,
};

#[derive(Debug)]
pub enum ReadyOutcome {
    /// Switch parked as SLAVE; the registry will call back.
    ControlRequested,
    /// Role support is off; the switch went straight to the active view.
    Promoted,
    /// The caller should wait the retry yield and close the connection.
    RegistryFailed(RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleErrorOutcome {
    /// Not an answer to the oldest pending role request.
    NotRoleError,
    Promoted,
    Closed,
}

struct Callback(Weak<Arbiter>);

impl ControlChangeCallback for Callback {
    fn control_changed(&self, id: SwitchId, has_control: bool) {
        if let Some(arbiter) = self.0.upgrade() {
            arbiter.control_changed(id, has_control);
        }
    }
}

pub struct Arbiter {
    /// READY records by identity, oldest first. Also the arbitration lock.
    connected: Mutex<HashMap<SwitchId, Vec<SwitchHandle>>>,
    table: Arc<SwitchTable>,
    registry: Arc<dyn MastershipRegistry>,
    role_changer: RoleChanger,
    /// `None` when role support is disabled.
    local_role: Option<Role>,
    always_clear_flows: AtomicBool,
    callback: Arc<dyn ControlChangeCallback>,
}

impl Arbiter {
    pub fn new(
        table: Arc<SwitchTable>,
        registry: Arc<dyn MastershipRegistry>,
        local_role: Option<Role>,
        always_clear_flows: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            connected: Mutex::new(HashMap::new()),
            table,
            registry,
            role_changer: RoleChanger::new(),
            local_role,
            always_clear_flows: AtomicBool::new(always_clear_flows),
            callback: Arc::new(Callback(weak.clone())),
        })
    }

    pub fn local_role(&self) -> Option<Role> {
        self.local_role
    }

    pub fn set_always_clear_flows(&self, value: bool) {
        self.always_clear_flows.store(value, Ordering::Relaxed);
    }

    pub fn connected_ids(&self) -> Vec<SwitchId> {
        let mut ids: Vec<_> = self.connected.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    /// READY records for `id`, oldest first.
    pub fn connected_records(&self, id: SwitchId) -> Vec<SwitchHandle> {
        self.connected.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Role requested when the registry hands us a switch.
    fn granted_role(&self) -> Role {
        match self.local_role {
            Some(Role::Equal) => Role::Equal,
            _ => Role::Master,
        }
    }

    /// Add to the active view, wiping flows on the first promotion of this
    /// record (or every time, if configured). Caller holds the lock.
    fn promote(&self, sw: &SwitchHandle) {
        if !sw.is_connected() {
            debug!(switch = %sw, "not promoting disconnected switch");
            return;
        }
        if self.table.is_active(sw) {
            return;
        }
        let first = sw.mark_master_seen();
        if first || self.always_clear_flows.load(Ordering::Relaxed) {
            match sw.clear_all_flow_mods() {
                Ok(()) => debug!(switch = %sw, first, "cleared flow table"),
                Err(e) => debug!(switch = %sw, error = %e, "could not clear flow table"),
            }
        }
        self.table.add_switch(sw);
    }

    /// Handshake just reached READY.
    pub fn on_switch_ready(&self, sw: &SwitchHandle, hs: &mut Handshake) -> ReadyOutcome {
        let mut connected = self.connected.lock();
        let records = connected.entry(sw.id()).or_default();
        if !records.iter().any(|r| Arc::ptr_eq(r, sw)) {
            if let Some(previous) = records.last() {
                debug!(dpid = %sw.id(), old = %previous.peer(), "another connection for a connected switch");
            }
            records.push(sw.clone());
        }

        if self.local_role.is_none() {
            hs.mark_first_role_reply();
            self.promote(sw);
            return ReadyOutcome::Promoted;
        }

        debug!(switch = %sw, "parking new switch as SLAVE");
        self.role_changer.submit_request(std::slice::from_ref(sw), Role::Slave);
        match self.registry.request_control(sw.id(), self.callback.clone()) {
            Ok(()) => ReadyOutcome::ControlRequested,
            Err(e) => {
                warn!(switch = %sw, error = %e, "could not request control");
                ReadyOutcome::RegistryFailed(e)
            }
        }
    }

    /// Registry verdict for `id`. A grant goes to the newest live record,
    /// which evicts any older one once promoted. A revocation goes to every
    /// live record, the active one first.
    pub fn control_changed(&self, id: SwitchId, has_control: bool) {
        let connected = self.connected.lock();
        let live: Vec<SwitchHandle> = connected
            .get(&id)
            .map(|records| records.iter().filter(|r| r.is_connected()).cloned().collect())
            .unwrap_or_default();
        if live.is_empty() {
            warn!(dpid = %id, has_control, "control change for a switch that is not connected");
            return;
        }

        let targets: Vec<SwitchHandle> = if has_control {
            live.last().cloned().into_iter().collect()
        } else {
            let (mut active, rest): (Vec<_>, Vec<_>) =
                live.into_iter().partition(|r| self.table.is_active(r));
            active.extend(rest);
            active
        };
        let role = if has_control {
            self.granted_role()
        } else {
            Role::Slave
        };

        for sw in &targets {
            info!(switch = %sw, %role, "control changed");
            let request = self.role_changer.submit_request(std::slice::from_ref(sw), role);
            if request.outcome(id) == Some(SubmitOutcome::Unsupported) {
                self.handle_unsupported(sw, role);
            }
        }
    }

    fn handle_unsupported(&self, sw: &SwitchHandle, role: Role) {
        if role == Role::Slave {
            warn!(switch = %sw, "switch cannot be told it is SLAVE; closing connection");
            sw.close();
        } else {
            self.promote(sw);
        }
    }

    /// ROLE_REPLY from a READY switch.
    pub fn on_role_reply(&self, sw: &SwitchHandle, hs: &mut Handshake, xid: Xid, role: Role) {
        let _connected = self.connected.lock();
        if !sw.is_connected() {
            debug!(switch = %sw, %role, "role reply for a switch already disconnected");
            return;
        }
        if !sw.deliver_role_reply(xid, role) {
            return;
        }
        debug!(switch = %sw, %role, xid, "role reply");
        let active = self.table.is_active(sw);
        if !active && sw.has_active_role() {
            self.promote(sw);
        } else if active && !sw.has_active_role() {
            self.table.remove_switch(sw);
        }
        hs.mark_first_role_reply();
    }

    /// ERROR from a READY switch. Answers whether it was about a role
    /// request and what happened to the switch.
    pub fn on_role_error(
        &self,
        sw: &SwitchHandle,
        hs: &mut Handshake,
        xid: Xid,
        err: ErrorMsg,
    ) -> RoleErrorOutcome {
        if !sw.check_first_pending_role_request_xid(xid) {
            return RoleErrorOutcome::NotRoleError;
        }
        if err.err_type != ErrorType::BadRequest {
            error!(switch = %sw, error = %err, "role request failed; closing connection");
            sw.close();
            return RoleErrorOutcome::Closed;
        }

        if hs.first_role_reply_received() && self.local_role.is_some() {
            warn!(switch = %sw, "switch rejected roles after answering a role request earlier");
        }
        hs.mark_first_role_reply();

        let _connected = self.connected.lock();
        let requested = sw.deliver_role_request_not_supported(xid);
        info!(switch = %sw, requested = ?requested, "switch does not support roles");
        if self.local_role == Some(Role::Slave) {
            warn!(switch = %sw, "closing connection; a SLAVE instance cannot hold a role-less switch");
            sw.close();
            return RoleErrorOutcome::Closed;
        }
        self.promote(sw);
        RoleErrorOutcome::Promoted
    }

    /// PORT_STATUS from a switch. Taken under the lock so port events are
    /// enqueued after the `SwitchAdded` of the promotion they follow.
    pub fn on_port_status(&self, sw: &SwitchHandle, reason: PortReason, desc: PortDesc) {
        let _connected = self.connected.lock();
        self.table.handle_port_status(sw, reason, desc);
    }

    /// Connection of a READY switch went away. Control is only given back
    /// once no record for the identity is left.
    pub fn on_disconnect(&self, sw: &SwitchHandle, control_requested: bool) {
        let mut connected = self.connected.lock();
        self.table.remove_switch(sw);
        let id = sw.id();
        let remaining = match connected.get_mut(&id) {
            Some(records) => {
                records.retain(|r| !Arc::ptr_eq(r, sw));
                records.len()
            }
            None => 0,
        };
        if remaining > 0 {
            debug!(switch = %sw, remaining, "other connections for this switch remain; keeping control request");
            return;
        }
        connected.remove(&id);
        if control_requested && !self.table.contains(id) {
            self.registry.release_control(id);
        }
    }

    /// Close every connected switch whose oldest role request is older than
    /// `timeout`. Returns the identities closed.
    pub fn expire_role_requests(&self, timeout: Duration, now: Instant) -> Vec<SwitchId> {
        let connected = self.connected.lock();
        connected
            .values()
            .flatten()
            .filter(|sw| {
                sw.oldest_pending_role()
                    .is_some_and(|p| now.saturating_duration_since(p.issued_at) >= timeout)
            })
            .map(|sw| {
                warn!(switch = %sw, "role request unanswered; closing connection");
                sw.close();
                sw.id()
            })
            .collect()
    }
}
