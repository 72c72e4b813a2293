//! Switch lifecycle events and the loop that delivers them.
//!
//! Producers (connection tasks, arbitration callbacks) enqueue
//! [`ControllerEvent`]s without waiting. A single task, [`run`], pops them
//! in order and hands each to every registered [`SwitchListener`]. A
//! panicking listener is logged and skipped; it never stops the loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{PortDesc, SwitchId};
use crate::switch::SwitchHandle;

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    SwitchAdded(SwitchHandle),
    SwitchRemoved(SwitchHandle),
    PortChanged(SwitchId),
    PortAdded(SwitchId, PortDesc),
    PortRemoved(SwitchId, PortDesc),
}

impl ControllerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::SwitchAdded(_) => "switch_added",
            ControllerEvent::SwitchRemoved(_) => "switch_removed",
            ControllerEvent::PortChanged(_) => "port_changed",
            ControllerEvent::PortAdded(..) => "port_added",
            ControllerEvent::PortRemoved(..) => "port_removed",
        }
    }

    pub fn switch_id(&self) -> SwitchId {
        match self {
            ControllerEvent::SwitchAdded(sw) | ControllerEvent::SwitchRemoved(sw) => sw.id(),
            ControllerEvent::PortChanged(id)
            | ControllerEvent::PortAdded(id, _)
            | ControllerEvent::PortRemoved(id, _) => *id,
        }
    }
}

/// Receives switch lifecycle notifications.
///
/// `removed_switch` can also be called directly, outside the loop, while
/// the controller holds its arbitration lock (duplicate eviction). It must
/// not call back into mastership operations.
pub trait SwitchListener: Send + Sync {
    fn name(&self) -> &str;

    fn added_switch(&self, sw: &SwitchHandle);

    fn removed_switch(&self, sw: &SwitchHandle);

    fn switch_port_changed(&self, id: SwitchId);

    /// Fine-grained port events. Ignored unless overridden.
    fn switch_port_added(&self, _id: SwitchId, _port: &PortDesc) {}

    fn switch_port_removed(&self, _id: SwitchId, _port: &PortDesc) {}
}

/// Shared, ordered set of lifecycle listeners.
#[derive(Clone, Default)]
pub struct SwitchListeners {
    inner: Arc<RwLock<Vec<Arc<dyn SwitchListener>>>>,
}

impl SwitchListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adding the same listener twice is a no-op.
    pub fn add(&self, listener: Arc<dyn SwitchListener>) {
        let mut list = self.inner.write();
        if list.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        debug!(listener = listener.name(), "switch listener added");
        list.push(listener);
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut list = self.inner.write();
        let before = list.len();
        list.retain(|l| l.name() != name);
        before != list.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().iter().map(|l| l.name().to_string()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn SwitchListener>> {
        self.inner.read().clone()
    }

    /// Deliver one event to every listener, in registration order.
    pub fn deliver(&self, event: &ControllerEvent) {
        for listener in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| match event {
                ControllerEvent::SwitchAdded(sw) => listener.added_switch(sw),
                ControllerEvent::SwitchRemoved(sw) => listener.removed_switch(sw),
                ControllerEvent::PortChanged(id) => listener.switch_port_changed(*id),
                ControllerEvent::PortAdded(id, port) => listener.switch_port_added(*id, port),
                ControllerEvent::PortRemoved(id, port) => listener.switch_port_removed(*id, port),
            }));
            if outcome.is_err() {
                error!(
                    listener = listener.name(),
                    event = event.kind(),
                    dpid = %event.switch_id(),
                    "switch listener panicked; continuing"
                );
            }
        }
    }

    /// Synchronous removal notice used during duplicate eviction.
    pub fn notify_removed(&self, sw: &SwitchHandle) {
        self.deliver(&ControllerEvent::SwitchRemoved(sw.clone()));
    }
}

// ── Queue ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Tx {
    Unbounded(mpsc::UnboundedSender<ControllerEvent>),
    Bounded(mpsc::Sender<ControllerEvent>),
}

/// Producer half. Never blocks: producers run under locks.
#[derive(Clone)]
pub struct EventSender {
    tx: Tx,
}

impl EventSender {
    /// Enqueue an event. A full bounded queue drops it with a warning; a
    /// closed queue (loop gone) drops it silently at debug.
    pub fn publish(&self, event: ControllerEvent) -> bool {
        let result = match &self.tx {
            Tx::Unbounded(tx) => tx.send(event).map_err(|e| (false, e.0)),
            Tx::Bounded(tx) => tx.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(ev) => (true, ev),
                mpsc::error::TrySendError::Closed(ev) => (false, ev),
            }),
        };
        match result {
            Ok(()) => true,
            Err((true, ev)) => {
                warn!(event = ev.kind(), dpid = %ev.switch_id(), "event queue full; event dropped");
                false
            }
            Err((false, ev)) => {
                debug!(event = ev.kind(), dpid = %ev.switch_id(), "event loop stopped; event dropped");
                false
            }
        }
    }
}

enum Rx {
    Unbounded(mpsc::UnboundedReceiver<ControllerEvent>),
    Bounded(mpsc::Receiver<ControllerEvent>),
}

pub struct EventReceiver {
    rx: Rx,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<ControllerEvent> {
        match &mut self.rx {
            Rx::Unbounded(rx) => rx.recv().await,
            Rx::Bounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<ControllerEvent> {
        match &mut self.rx {
            Rx::Unbounded(rx) => rx.try_recv().ok(),
            Rx::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// `capacity == 0` builds an unbounded queue.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSender {
                tx: Tx::Unbounded(tx),
            },
            EventReceiver {
                rx: Rx::Unbounded(rx),
            },
        )
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (
            EventSender { tx: Tx::Bounded(tx) },
            EventReceiver { rx: Rx::Bounded(rx) },
        )
    }
}

/// Run the event dispatch loop until `shutdown` is cancelled. Events still
/// queued at that point are discarded.
pub async fn run(mut rx: EventReceiver, listeners: SwitchListeners, shutdown: CancellationToken) {
    info!(listeners = ?listeners.names(), "event loop ready");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("event loop shutting down");
                break;
            }

            event = rx.recv() => match event {
                Some(event) => {
                    debug!(event = event.kind(), dpid = %event.switch_id(), "dispatching event");
                    listeners.deliver(&event);
                }
                None => {
                    info!("event queue closed; event loop exiting");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::testing::record;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
        fine_grained: bool,
    }

    impl Recorder {
        fn named(name: &str, fine_grained: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                fine_grained,
                ..Default::default()
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().clone()
        }
    }

    impl SwitchListener for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn added_switch(&self, sw: &SwitchHandle) {
            self.seen.lock().push(format!("added {}", sw.id().0));
        }
        fn removed_switch(&self, sw: &SwitchHandle) {
            self.seen.lock().push(format!("removed {}", sw.id().0));
        }
        fn switch_port_changed(&self, id: SwitchId) {
            self.seen.lock().push(format!("changed {}", id.0));
        }
        fn switch_port_added(&self, id: SwitchId, port: &PortDesc) {
            if self.fine_grained {
                self.seen.lock().push(format!("port+ {} {}", id.0, port.number));
            }
        }
    }

    struct Panicker;

    impl SwitchListener for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }
        fn added_switch(&self, _sw: &SwitchHandle) {
            panic!("listener bug");
        }
        fn removed_switch(&self, _sw: &SwitchHandle) {}
        fn switch_port_changed(&self, _id: SwitchId) {}
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn events_arrive_in_enqueue_order() {
        let listeners = SwitchListeners::new();
        let rec = Recorder::named("rec", false);
        listeners.add(rec.clone());
        let (tx, rx) = channel(0);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(rx, listeners, shutdown.clone()));

        let (a, _) = record(1);
        let (b, _) = record(2);
        tx.publish(ControllerEvent::SwitchAdded(a.clone()));
        tx.publish(ControllerEvent::SwitchAdded(b));
        tx.publish(ControllerEvent::PortChanged(SwitchId(1)));
        tx.publish(ControllerEvent::SwitchRemoved(a));
        settle().await;

        assert_eq!(rec.seen(), vec!["added 1", "added 2", "changed 1", "removed 1"]);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_loop() {
        let listeners = SwitchListeners::new();
        listeners.add(Arc::new(Panicker));
        let rec = Recorder::named("rec", false);
        listeners.add(rec.clone());
        let (tx, rx) = channel(0);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(rx, listeners, shutdown.clone()));

        let (a, _) = record(1);
        let (b, _) = record(2);
        tx.publish(ControllerEvent::SwitchAdded(a));
        tx.publish(ControllerEvent::SwitchAdded(b));
        settle().await;

        assert_eq!(rec.seen(), vec!["added 1", "added 2"]);
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn port_added_only_reaches_opted_in_listeners() {
        let listeners = SwitchListeners::new();
        let coarse = Recorder::named("coarse", false);
        let fine = Recorder::named("fine", true);
        listeners.add(coarse.clone());
        listeners.add(fine.clone());
        let port = PortDesc {
            number: 4,
            name: "eth4".into(),
            hw_addr: String::new(),
            config: 0,
            state: 0,
        };
        listeners.deliver(&ControllerEvent::PortAdded(SwitchId(9), port));
        assert!(coarse.seen().is_empty());
        assert_eq!(fine.seen(), vec!["port+ 9 4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_queued_events() {
        let listeners = SwitchListeners::new();
        let rec = Recorder::named("rec", false);
        listeners.add(rec.clone());
        let (tx, rx) = channel(0);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let (a, _) = record(1);
        tx.publish(ControllerEvent::SwitchAdded(a));

        tokio::time::timeout(Duration::from_secs(1), run(rx, listeners, shutdown))
            .await
            .unwrap();
        assert!(rec.seen().is_empty());
    }

    #[tokio::test]
    async fn full_bounded_queue_drops() {
        let (tx, mut rx) = channel(1);
        assert!(tx.publish(ControllerEvent::PortChanged(SwitchId(1))));
        assert!(!tx.publish(ControllerEvent::PortChanged(SwitchId(2))));
        assert_eq!(rx.recv().await.unwrap().switch_id(), SwitchId(1));
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn duplicate_listener_registration_is_ignored() {
        let listeners = SwitchListeners::new();
        let rec = Recorder::named("rec", false);
        listeners.add(rec.clone());
        listeners.add(rec);
        assert_eq!(listeners.names(), vec!["rec"]);
        assert!(listeners.remove("rec"));
        assert!(!listeners.remove("rec"));
    }
}
