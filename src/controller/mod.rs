//! The controller: owns the switch table, the arbiter, both listener
//! registries and the event queue, and hands out one [`ChannelHandler`] per
//! switch connection.
//!
//! Everything is constructed once in [`Controller::new`] and shared by
//! cloning the handle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{Config, EventsConfig, MastershipConfig};
use crate::dispatch::{DispatchContext, ListenerRegistry, MessageListener};
use crate::events::{self, EventReceiver, SwitchListener, SwitchListeners};
use crate::mastership::{Arbiter, MastershipRegistry, role_changer};
use crate::protocol::{Frame, MessageType, SwitchId};
use crate::switch::{PortDiscoveryHook, SwitchConnection, SwitchHandle, SwitchTable};

mod channel;
mod error;

pub use channel::ChannelHandler;
pub use error::ChannelError;

/// The slice of [`Config`] the controller core needs.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub controller_id: String,
    pub mastership: MastershipConfig,
    pub events: EventsConfig,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            controller_id: config.controller_id.clone(),
            mastership: config.mastership.clone(),
            events: config.events.clone(),
        }
    }
}

struct Inner {
    settings: ControllerSettings,
    table: Arc<SwitchTable>,
    arbiter: Arc<Arbiter>,
    message_listeners: ListenerRegistry,
    switch_listeners: SwitchListeners,
    registry: Arc<dyn MastershipRegistry>,
    events_rx: Mutex<Option<EventReceiver>>,
    started_at: SystemTime,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(settings: ControllerSettings, registry: Arc<dyn MastershipRegistry>) -> Self {
        let (events_tx, events_rx) = events::channel(settings.events.queue_capacity);
        let switch_listeners = SwitchListeners::new();
        let table = Arc::new(SwitchTable::new(events_tx, switch_listeners.clone()));
        let local_role = settings
            .mastership
            .role_support
            .then_some(settings.mastership.local_role);
        let arbiter = Arbiter::new(
            table.clone(),
            registry.clone(),
            local_role,
            settings.mastership.always_clear_flows,
        );
        Self {
            inner: Arc::new(Inner {
                settings,
                table,
                arbiter,
                message_listeners: ListenerRegistry::new(),
                switch_listeners,
                registry,
                events_rx: Mutex::new(Some(events_rx)),
                started_at: SystemTime::now(),
            }),
        }
    }

    /// Register with the mastership registry and spawn the event loop (plus
    /// the role request sweeper, if configured). Only the first call spawns
    /// anything.
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(rx) = self.inner.events_rx.lock().take() else {
            warn!("controller already started");
            return Vec::new();
        };

        let id = &self.inner.settings.controller_id;
        match self.inner.registry.register_controller(id) {
            Ok(()) => info!(controller_id = %id, "registered with mastership registry"),
            Err(e) => warn!(controller_id = %id, error = %e, "controller registration failed"),
        }

        let mut tasks = vec![tokio::spawn(events::run(
            rx,
            self.inner.switch_listeners.clone(),
            shutdown.clone(),
        ))];
        if let (true, Some(timeout)) = (
            self.inner.settings.mastership.role_support,
            self.inner.settings.mastership.role_request_timeout,
        ) {
            tasks.push(tokio::spawn(role_changer::run_timeout_sweeper(
                self.inner.arbiter.clone(),
                timeout,
                shutdown,
            )));
        }
        tasks
    }

    pub fn controller_id(&self) -> &str {
        &self.inner.settings.controller_id
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.inner.settings
    }

    pub fn system_start_time(&self) -> SystemTime {
        self.inner.started_at
    }

    pub fn registry(&self) -> &Arc<dyn MastershipRegistry> {
        &self.inner.registry
    }

    pub(crate) fn arbiter(&self) -> &Arc<Arbiter> {
        &self.inner.arbiter
    }

    pub(crate) fn table(&self) -> &SwitchTable {
        &self.inner.table
    }

    pub(crate) fn message_listeners(&self) -> &ListenerRegistry {
        &self.inner.message_listeners
    }

    pub fn set_always_clear_flows(&self, value: bool) {
        self.inner.arbiter.set_always_clear_flows(value);
    }

    // ── Listeners ────────────────────────────────────────────────────────

    pub fn add_switch_listener(&self, listener: Arc<dyn SwitchListener>) {
        self.inner.switch_listeners.add(listener);
    }

    pub fn remove_switch_listener(&self, name: &str) -> bool {
        self.inner.switch_listeners.remove(name)
    }

    /// Install (or clear) the hook consulted before port-added events.
    pub fn set_discovery_hook(&self, hook: Option<Arc<dyn PortDiscoveryHook>>) {
        self.inner.table.set_discovery_hook(hook);
    }

    pub fn add_message_listener(&self, kind: MessageType, listener: Arc<dyn MessageListener>) {
        self.inner.message_listeners.add_listener(kind, listener);
    }

    pub fn remove_message_listener(&self, kind: MessageType, name: &str) -> bool {
        self.inner.message_listeners.remove_listener(kind, name)
    }

    pub fn remove_message_listeners(&self, kind: MessageType) {
        self.inner.message_listeners.remove_all(kind);
    }

    /// Ordered message listener names per type.
    pub fn listeners(&self) -> BTreeMap<MessageType, Vec<String>> {
        self.inner.message_listeners.listener_names()
    }

    // ── Switches ─────────────────────────────────────────────────────────

    /// Active switches, sorted by identity.
    pub fn switches(&self) -> Vec<SwitchHandle> {
        self.inner.table.snapshot()
    }

    pub fn switch(&self, id: SwitchId) -> Option<SwitchHandle> {
        self.inner.table.get(id)
    }

    /// READY switches, mastered or not.
    pub fn connected_switch_ids(&self) -> Vec<SwitchId> {
        self.inner.arbiter.connected_ids()
    }

    /// Run the listener chain for a locally produced message as if `sw` had
    /// sent it. Refused unless `sw` is the active record for its identity.
    pub fn inject_message(
        &self,
        sw: &SwitchHandle,
        frame: Frame,
        ctx: Option<&mut DispatchContext>,
    ) -> bool {
        if !self.inner.table.is_active(sw) {
            warn!(switch = %sw, kind = %frame.message_type(), "not injecting message; switch not active");
            return false;
        }
        let _guard = sw.listener_read_recursive();
        if !sw.is_connected() {
            debug!(switch = %sw, "not injecting message; switch disconnected");
            return false;
        }
        self.inner.message_listeners.dispatch(sw, &frame, ctx);
        true
    }

    /// Let listeners registered for the type observe a message being sent
    /// to `sw`.
    pub fn handle_outgoing_message(
        &self,
        sw: &SwitchHandle,
        frame: &Frame,
        ctx: Option<&mut DispatchContext>,
    ) {
        if !self
            .inner
            .message_listeners
            .has_listeners(frame.message_type())
        {
            return;
        }
        let _guard = sw.listener_read_recursive();
        if sw.is_connected() {
            self.inner.message_listeners.dispatch(sw, frame, ctx);
        }
    }

    /// Handler for a freshly accepted connection.
    pub fn channel(&self, conn: Arc<dyn SwitchConnection>) -> ChannelHandler {
        ChannelHandler::new(self.clone(), conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Command;
    use crate::mastership::LocalRegistry;
    use crate::protocol::Message;
    use crate::switch::testing::record;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Count(AtomicUsize);

    impl MessageListener for Count {
        fn name(&self) -> &str {
            "count"
        }
        fn receive(&self, _sw: &SwitchHandle, _f: &Frame, _ctx: &mut DispatchContext) -> Command {
            self.0.fetch_add(1, Ordering::SeqCst);
            Command::Continue
        }
    }

    fn controller(role_support: bool) -> Controller {
        let mut settings = ControllerSettings::from_config(&Config::test_default());
        settings.mastership.role_support = role_support;
        Controller::new(settings, LocalRegistry::new(true))
    }

    #[tokio::test]
    async fn inject_requires_active_switch() {
        let ctl = controller(false);
        let count = Arc::new(Count(AtomicUsize::new(0)));
        ctl.add_message_listener(MessageType::PacketIn, count.clone());
        let (sw, _) = record(5);
        let frame = Frame::new(1, Message::PacketIn { in_port: 1, data: vec![1] });

        assert!(!ctl.inject_message(&sw, frame.clone(), None));
        ctl.table().add_switch(&sw);
        assert!(ctl.inject_message(&sw, frame, None));
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outgoing_messages_reach_listeners() {
        let ctl = controller(false);
        let count = Arc::new(Count(AtomicUsize::new(0)));
        ctl.add_message_listener(MessageType::FlowMod, count.clone());
        let (sw, _) = record(5);
        ctl.handle_outgoing_message(&sw, &Frame::new(9, Message::delete_all_flows()), None);
        ctl.handle_outgoing_message(&sw, &Frame::new(10, Message::BarrierRequest), None);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_snapshot_and_removal() {
        let ctl = controller(true);
        ctl.add_message_listener(MessageType::PacketIn, Arc::new(Count(AtomicUsize::new(0))));
        assert_eq!(ctl.listeners()[&MessageType::PacketIn], vec!["count"]);
        assert!(ctl.remove_message_listener(MessageType::PacketIn, "count"));
        assert!(ctl.listeners().is_empty());
    }

    #[tokio::test]
    async fn start_only_spawns_once() {
        let ctl = controller(true);
        let shutdown = CancellationToken::new();
        let first = ctl.start(shutdown.clone());
        assert_eq!(first.len(), 1);
        assert!(ctl.start(shutdown.clone()).is_empty());
        shutdown.cancel();
        for task in first {
            task.await.unwrap();
        }
    }
}
