//! Shared harness for the controller integration tests: an in-memory switch
//! connection, a lifecycle recorder and a scripted switch driver.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use trellis::config::{EventsConfig, MastershipConfig};
use trellis::controller::ChannelHandler;
use trellis::events::SwitchListener;
use trellis::mastership::{
    ControlChangeCallback, MastershipRegistry, RegistryError,
};
use trellis::protocol::{
    Description, Features, Frame, MISS_SEND_LEN_MAX, Message, PortDesc, Role, StatsReplyBody,
    StatsRequestBody, SwitchId, Xid,
};
use trellis::switch::{SendError, SwitchConnection, SwitchHandle};
use trellis::{Controller, ControllerSettings};

// ── connection ───────────────────────────────────────────────────────────────

pub struct MemConnection {
    peer: String,
    sent: Mutex<Vec<Frame>>,
    closed: AtomicBool,
}

impl MemConnection {
    pub fn new(peer: &str) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub fn flow_clears(&self) -> usize {
        self.sent()
            .iter()
            .filter(|f| f.msg == Message::delete_all_flows())
            .count()
    }

    /// Xids of role requests asking for `role`, oldest first.
    pub fn role_requests(&self, role: Role) -> Vec<Xid> {
        self.sent()
            .iter()
            .filter(|f| f.msg == Message::RoleRequest { role })
            .map(|f| f.xid)
            .collect()
    }
}

impl SwitchConnection for MemConnection {
    fn send(&self, frame: Frame) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

// ── lifecycle recorder ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Added(SwitchId, u64),
    Removed(SwitchId, u64),
    PortChanged(SwitchId),
}

#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn added(&self) -> usize {
        self.seen()
            .iter()
            .filter(|s| matches!(s, Seen::Added(..)))
            .count()
    }

    pub fn removed(&self) -> usize {
        self.seen()
            .iter()
            .filter(|s| matches!(s, Seen::Removed(..)))
            .count()
    }
}

impl SwitchListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn added_switch(&self, sw: &SwitchHandle) {
        self.seen.lock().push(Seen::Added(sw.id(), sw.serial()));
    }

    fn removed_switch(&self, sw: &SwitchHandle) {
        self.seen.lock().push(Seen::Removed(sw.id(), sw.serial()));
    }

    fn switch_port_changed(&self, id: SwitchId) {
        self.seen.lock().push(Seen::PortChanged(id));
    }
}

// ── registries ───────────────────────────────────────────────────────────────

/// Registry that refuses every control request.
pub struct BrokenRegistry;

impl MastershipRegistry for BrokenRegistry {
    fn register_controller(&self, _id: &str) -> Result<(), RegistryError> {
        Ok(())
    }

    fn request_control(
        &self,
        _id: SwitchId,
        _cb: Arc<dyn ControlChangeCallback>,
    ) -> Result<(), RegistryError> {
        Err(RegistryError::Unavailable("cluster unreachable".into()))
    }

    fn release_control(&self, _id: SwitchId) {}

    fn has_control(&self, _id: SwitchId) -> bool {
        false
    }

    fn controller_for_switch(&self, _id: SwitchId) -> Result<Option<String>, RegistryError> {
        Ok(None)
    }
}

// ── settings ─────────────────────────────────────────────────────────────────

pub fn settings(role_support: bool) -> ControllerSettings {
    ControllerSettings {
        controller_id: "it-controller".into(),
        mastership: MastershipConfig {
            role_support,
            local_role: Role::Master,
            always_clear_flows: false,
            role_request_timeout: None,
            control_request_retry_yield: Duration::from_millis(1),
        },
        events: EventsConfig { queue_capacity: 0 },
    }
}

pub fn features(id: u64) -> Features {
    Features {
        datapath_id: SwitchId(id),
        n_buffers: 256,
        n_tables: 1,
        capabilities: 0,
        ports: vec![PortDesc {
            number: 1,
            name: "eth1".into(),
            hw_addr: "00:00:00:00:00:01".into(),
            config: 0,
            state: 0,
        }],
    }
}

pub fn description() -> Description {
    Description {
        manufacturer: "Acme".into(),
        hardware: "bench".into(),
        software: "1.0".into(),
        serial_number: "0001".into(),
        datapath: "lab".into(),
    }
}

/// Poll `cond` every few milliseconds for up to two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── scripted switch ──────────────────────────────────────────────────────────

pub struct SimSwitch {
    pub conn: Arc<MemConnection>,
    pub handler: ChannelHandler,
    pub id: u64,
}

impl SimSwitch {
    pub fn connect(controller: &Controller, id: u64) -> Self {
        let conn = MemConnection::new(&format!("mem:{id}"));
        let mut handler = controller.channel(conn.clone());
        handler.channel_connected().expect("hello");
        Self { conn, handler, id }
    }

    /// Connect and run the handshake through READY.
    pub async fn ready(controller: &Controller, id: u64) -> Self {
        let mut sim = Self::connect(controller, id);
        assert!(sim.feed(0, Message::Hello).await);
        assert!(sim.feed(1, Message::FeaturesReply(features(id))).await);
        assert!(sim.config_reply().await);
        assert!(sim.description_reply().await);
        assert!(sim.handler.is_ready());
        sim
    }

    pub fn switch(&self) -> SwitchHandle {
        self.handler.switch().cloned().expect("switch record")
    }

    /// Deliver one frame; tear the channel down if the controller closed it.
    pub async fn feed(&mut self, xid: Xid, msg: Message) -> bool {
        let open = self.handler.handle_frame(Frame::new(xid, msg)).await;
        if !open {
            self.handler.channel_disconnected();
        }
        open
    }

    pub async fn config_reply(&mut self) -> bool {
        self.feed(2, Message::GetConfigReply { miss_send_len: MISS_SEND_LEN_MAX })
            .await
    }

    pub async fn description_reply(&mut self) -> bool {
        let xid = self
            .conn
            .sent()
            .iter()
            .find(|f| {
                f.msg
                    == Message::StatsRequest {
                        body: StatsRequestBody::Description,
                    }
            })
            .map(|f| f.xid)
            .expect("description request");
        self.feed(
            xid,
            Message::StatsReply {
                body: StatsReplyBody::Description(description()),
            },
        )
        .await
    }

    /// Answer the newest request for `role` with the same role.
    pub async fn accept_role(&mut self, role: Role) -> bool {
        let xid = *self.conn.role_requests(role).last().expect("role request");
        self.feed(xid, Message::RoleReply { role }).await
    }

    pub async fn packet_in(&mut self) -> bool {
        self.feed(
            99,
            Message::PacketIn {
                in_port: 1,
                data: vec![0xde, 0xad],
            },
        )
        .await
    }

    pub fn disconnect(&mut self) {
        self.handler.channel_disconnected();
    }
}
