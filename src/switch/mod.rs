//! Per-connection switch state.
//!
//! A [`SwitchRecord`] is created once the handshake FEATURES_REPLY reveals
//! the switch identity and lives until the connection closes. Two records can
//! share an identity for a while; [`table::SwitchTable`] resolves that.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{
    Description, Features, Frame, Message, PortDesc, Role, StatsReplyBody, StatsRequestBody,
    SwitchId, Xid,
};

pub mod table;

pub use table::{PortDiscoveryHook, SwitchTable};

pub type SwitchHandle = Arc<SwitchRecord>;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
}

/// Outbound half of a switch connection.
///
/// `send` must not block: it is called while arbitration locks are held.
pub trait SwitchConnection: Send + Sync {
    fn send(&self, frame: Frame) -> Result<(), SendError>;
    /// Idempotent.
    fn close(&self);
    fn is_closed(&self) -> bool;
    /// Remote address for logs.
    fn peer(&self) -> String;
}

/// A role request that has been written but not yet answered.
#[derive(Debug, Clone, Copy)]
pub struct PendingRole {
    pub xid: Xid,
    pub role: Role,
    pub issued_at: Instant,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

pub struct SwitchRecord {
    id: SwitchId,
    serial: u64,
    conn: Arc<dyn SwitchConnection>,
    connected: AtomicBool,
    connected_since: SystemTime,
    role: Mutex<Option<Role>>,
    roles_supported: Mutex<Option<bool>>,
    master_seen: AtomicBool,
    features: RwLock<Features>,
    ports: RwLock<BTreeMap<u16, PortDesc>>,
    description: RwLock<Option<Description>>,
    /// Readers dispatch messages; the writer disconnects. Holding a read
    /// guard guarantees `is_connected()` stays put for the duration.
    listener_lock: RwLock<()>,
    next_xid: AtomicU32,
    pending_stats: Mutex<HashMap<Xid, oneshot::Sender<StatsReplyBody>>>,
    pending_roles: Mutex<VecDeque<PendingRole>>,
}

impl std::fmt::Debug for SwitchRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchRecord")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("peer", &self.conn.peer())
            .field("connected", &self.is_connected())
            .field("role", &self.role())
            .finish()
    }
}

impl std::fmt::Display for SwitchRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} DPID[{}]]", self.conn.peer(), self.id)
    }
}

impl SwitchRecord {
    pub fn new(features: Features, conn: Arc<dyn SwitchConnection>) -> SwitchHandle {
        let ports = features
            .ports
            .iter()
            .map(|p| (p.number, p.clone()))
            .collect();
        Arc::new(Self {
            id: features.datapath_id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            conn,
            connected: AtomicBool::new(true),
            connected_since: SystemTime::now(),
            role: Mutex::new(None),
            roles_supported: Mutex::new(None),
            master_seen: AtomicBool::new(false),
            features: RwLock::new(features),
            ports: RwLock::new(ports),
            description: RwLock::new(None),
            listener_lock: RwLock::new(()),
            next_xid: AtomicU32::new(1),
            pending_stats: Mutex::new(HashMap::new()),
            pending_roles: Mutex::new(VecDeque::new()),
        })
    }

    pub fn id(&self) -> SwitchId {
        self.id
    }

    /// Unique per record, even across records with the same identity.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer(&self) -> String {
        self.conn.peer()
    }

    pub fn connected_since(&self) -> SystemTime {
        self.connected_since
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    // ── Roles ────────────────────────────────────────────────────────────

    /// Last role confirmed by the switch; `None` before any reply or when
    /// the switch does not understand roles.
    pub fn role(&self) -> Option<Role> {
        *self.role.lock()
    }

    pub fn set_role(&self, role: Option<Role>) {
        *self.role.lock() = role;
    }

    /// Anything but SLAVE may sit in the active view.
    pub fn has_active_role(&self) -> bool {
        self.role() != Some(Role::Slave)
    }

    /// `Some(false)` once the switch rejected a role request as unsupported.
    pub fn roles_supported(&self) -> Option<bool> {
        *self.roles_supported.lock()
    }

    /// True the first time this is called for the record.
    pub fn mark_master_seen(&self) -> bool {
        !self.master_seen.swap(true, Ordering::AcqRel)
    }

    pub fn push_pending_role(&self, pending: PendingRole) {
        self.pending_roles.lock().push_back(pending);
    }

    /// Is `xid` the oldest outstanding role request?
    pub fn check_first_pending_role_request_xid(&self, xid: Xid) -> bool {
        self.pending_roles.lock().front().is_some_and(|p| p.xid == xid)
    }

    pub fn oldest_pending_role(&self) -> Option<PendingRole> {
        self.pending_roles.lock().front().copied()
    }

    pub fn pending_role_count(&self) -> usize {
        self.pending_roles.lock().len()
    }

    /// Match a role reply against the outstanding requests and adopt the
    /// reported role. Requests older than `xid` are dropped as unanswered.
    /// Returns false for a reply nobody asked for.
    pub fn deliver_role_reply(&self, xid: Xid, role: Role) -> bool {
        let mut pending = self.pending_roles.lock();
        if !pending.iter().any(|p| p.xid == xid) {
            warn!(switch = %self, xid, %role, "role reply does not match any pending request");
            return false;
        }
        while let Some(head) = pending.pop_front() {
            if head.xid == xid {
                if head.role != role {
                    warn!(switch = %self, requested = %head.role, reported = %role, "switch reported a different role than requested");
                }
                break;
            }
            debug!(switch = %self, xid = head.xid, "dropping unanswered role request");
        }
        drop(pending);
        *self.roles_supported.lock() = Some(true);
        self.set_role(Some(role));
        true
    }

    /// The switch rejected request `xid` as unsupported. Clears the role and
    /// returns the role that had been requested.
    pub fn deliver_role_request_not_supported(&self, xid: Xid) -> Option<Role> {
        let mut pending = self.pending_roles.lock();
        let requested = match pending.front() {
            Some(head) if head.xid == xid => pending.pop_front().map(|p| p.role),
            _ => None,
        };
        drop(pending);
        *self.roles_supported.lock() = Some(false);
        self.set_role(None);
        requested
    }

    // ── Features, ports, description ─────────────────────────────────────

    pub fn features(&self) -> Features {
        self.features.read().clone()
    }

    /// Replace the feature set and the port map with it.
    pub fn set_features(&self, features: Features) {
        let ports = features
            .ports
            .iter()
            .map(|p| (p.number, p.clone()))
            .collect();
        *self.ports.write() = ports;
        *self.features.write() = features;
    }

    pub fn ports(&self) -> Vec<PortDesc> {
        self.ports.read().values().cloned().collect()
    }

    pub fn port(&self, number: u16) -> Option<PortDesc> {
        self.ports.read().get(&number).cloned()
    }

    /// Insert or replace a port, returning the previous description.
    pub fn set_port(&self, desc: PortDesc) -> Option<PortDesc> {
        self.ports.write().insert(desc.number, desc)
    }

    pub fn delete_port(&self, number: u16) -> Option<PortDesc> {
        self.ports.write().remove(&number)
    }

    pub fn description(&self) -> Option<Description> {
        self.description.read().clone()
    }

    pub fn set_description(&self, description: Description) {
        *self.description.write() = Some(description);
    }

    // ── Listener lock ────────────────────────────────────────────────────

    pub fn listener_read(&self) -> RwLockReadGuard<'_, ()> {
        self.listener_lock.read()
    }

    /// For dispatch paths that may already hold a read guard on this record.
    pub fn listener_read_recursive(&self) -> RwLockReadGuard<'_, ()> {
        self.listener_lock.read_recursive()
    }

    pub fn listener_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.listener_lock.write()
    }

    // ── Output ───────────────────────────────────────────────────────────

    pub fn next_xid(&self) -> Xid {
        self.next_xid.fetch_add(1, Ordering::Relaxed)
    }

    /// Send with a fresh transaction id.
    pub fn write(&self, msg: Message) -> Result<Xid, SendError> {
        let xid = self.next_xid();
        self.conn.send(Frame::new(xid, msg))?;
        Ok(xid)
    }

    pub fn write_frame(&self, frame: Frame) -> Result<(), SendError> {
        self.conn.send(frame)
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Wipe every flow entry on the switch.
    pub fn clear_all_flow_mods(&self) -> Result<(), SendError> {
        self.write(Message::delete_all_flows())?;
        self.write(Message::BarrierRequest)?;
        Ok(())
    }

    // ── Statistics ───────────────────────────────────────────────────────

    /// Send a statistics request and get a receiver for its reply. The
    /// receiver resolves to an error if the request is cancelled.
    pub fn request_statistics(
        &self,
        body: StatsRequestBody,
    ) -> Result<oneshot::Receiver<StatsReplyBody>, SendError> {
        let xid = self.next_xid();
        let (tx, rx) = oneshot::channel();
        self.pending_stats.lock().insert(xid, tx);
        if let Err(e) = self.conn.send(Frame::new(xid, Message::StatsRequest { body })) {
            self.pending_stats.lock().remove(&xid);
            return Err(e);
        }
        Ok(rx)
    }

    /// Complete the request with transaction id `xid`. False if none waits.
    pub fn deliver_statistics_reply(&self, xid: Xid, body: StatsReplyBody) -> bool {
        match self.pending_stats.lock().remove(&xid) {
            Some(tx) => tx.send(body).is_ok(),
            None => false,
        }
    }

    pub fn cancel_all_statistics_replies(&self) {
        let cancelled: Vec<_> = self.pending_stats.lock().drain().collect();
        if !cancelled.is_empty() {
            debug!(switch = %self, count = cancelled.len(), "cancelled pending statistics requests");
        }
    }

    pub fn pending_statistics_count(&self) -> usize {
        self.pending_stats.lock().len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn pending(xid: Xid, role: Role) -> PendingRole {
        PendingRole {
            xid,
            role,
            issued_at: Instant::now(),
        }
    }

    #[test]
    fn records_get_distinct_serials() {
        let (a, _) = record(1);
        let (b, _) = record(1);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.serial(), b.serial());
    }

    #[test]
    fn ports_come_from_features() {
        let (sw, _) = record(1);
        assert_eq!(sw.ports().len(), 1);
        assert_eq!(sw.port(1).unwrap().name, "eth1");
    }

    #[test]
    fn role_reply_matches_pending_xid() {
        let (sw, _) = record(1);
        sw.push_pending_role(pending(5, Role::Slave));
        sw.push_pending_role(pending(6, Role::Master));
        assert!(sw.check_first_pending_role_request_xid(5));
        assert!(!sw.check_first_pending_role_request_xid(6));

        assert!(sw.deliver_role_reply(6, Role::Master));
        assert_eq!(sw.role(), Some(Role::Master));
        assert_eq!(sw.pending_role_count(), 0);
        assert_eq!(sw.roles_supported(), Some(true));
    }

    #[test]
    fn unsolicited_role_reply_is_ignored() {
        let (sw, _) = record(1);
        sw.push_pending_role(pending(5, Role::Slave));
        assert!(!sw.deliver_role_reply(99, Role::Master));
        assert_eq!(sw.role(), None);
        assert_eq!(sw.pending_role_count(), 1);
    }

    #[test]
    fn unsupported_role_request_returns_requested_role() {
        let (sw, _) = record(1);
        sw.set_role(Some(Role::Slave));
        sw.push_pending_role(pending(3, Role::Master));
        assert_eq!(sw.deliver_role_request_not_supported(3), Some(Role::Master));
        assert_eq!(sw.role(), None);
        assert_eq!(sw.roles_supported(), Some(false));
        assert!(sw.has_active_role());
    }

    #[test]
    fn master_seen_is_reported_once() {
        let (sw, _) = record(1);
        assert!(sw.mark_master_seen());
        assert!(!sw.mark_master_seen());
    }

    #[test]
    fn clear_flows_writes_delete_all() {
        let (sw, conn) = record(1);
        sw.clear_all_flow_mods().unwrap();
        let sent = conn.sent();
        assert_eq!(sent[0].msg, Message::delete_all_flows());
        assert_eq!(sent[1].msg, Message::BarrierRequest);
    }

    #[tokio::test]
    async fn statistics_reply_resolves_receiver() {
        let (sw, conn) = record(1);
        let rx = sw.request_statistics(StatsRequestBody::Description).unwrap();
        let xid = conn.sent()[0].xid;
        let body = StatsReplyBody::Description(Description {
            manufacturer: "acme".into(),
            ..Default::default()
        });
        assert!(sw.deliver_statistics_reply(xid, body.clone()));
        assert_eq!(rx.await.unwrap(), body);
        assert!(!sw.deliver_statistics_reply(xid, body));
    }

    #[tokio::test]
    async fn cancel_fails_pending_receivers() {
        let (sw, _) = record(1);
        let rx = sw.request_statistics(StatsRequestBody::Port { port: None }).unwrap();
        assert_eq!(sw.pending_statistics_count(), 1);
        sw.cancel_all_statistics_replies();
        assert_eq!(sw.pending_statistics_count(), 0);
        assert!(rx.await.is_err());
    }

    #[test]
    fn writes_after_close_fail() {
        let (sw, conn) = record(1);
        sw.close();
        assert!(sw.is_closed());
        assert!(sw.write(Message::EchoRequest).is_err());
        assert!(sw.request_statistics(StatsRequestBody::Description).is_err());
        assert_eq!(sw.pending_statistics_count(), 0);
        assert_eq!(conn.close_count(), 1);
    }
}
