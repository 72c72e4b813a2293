//! Message listener registry.
//!
//! Listeners register per [`MessageType`]. For each message the chain for its
//! type runs in order until a listener answers [`Command::Stop`]. Listeners
//! can filter by switch and can ask to run before or after other listeners
//! (by name); the chain is re-sorted on every registration.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::protocol::{Frame, Message, MessageType};
use crate::switch::{SwitchHandle, SwitchRecord};

/// What the chain does after a listener returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Continue,
    Stop,
}

/// A subscriber to switch messages of one or more types.
pub trait MessageListener: Send + Sync {
    /// Unique within a chain; ordering constraints refer to it.
    fn name(&self) -> &str;

    fn receive(&self, sw: &SwitchHandle, frame: &Frame, ctx: &mut DispatchContext) -> Command;

    /// Switch filter. Uninterested listeners are skipped without ending the
    /// chain.
    fn is_interested(&self, _sw: &SwitchRecord) -> bool {
        true
    }

    /// Must this listener run before `other` for `kind`?
    fn runs_before(&self, _kind: MessageType, _other: &str) -> bool {
        false
    }

    /// Must this listener run after `other` for `kind`?
    fn runs_after(&self, _kind: MessageType, _other: &str) -> bool {
        false
    }
}

/// Scratch space shared by the listeners of one dispatch.
#[derive(Default)]
pub struct DispatchContext {
    values: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send>(&mut self, key: &'static str, value: T) {
        self.values.insert(key, Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

const POOL_MAX: usize = 32;

#[derive(Default)]
struct ContextPool {
    free: Mutex<Vec<DispatchContext>>,
}

impl ContextPool {
    fn acquire(&self) -> DispatchContext {
        self.free.lock().pop().unwrap_or_default()
    }

    fn release(&self, mut ctx: DispatchContext) {
        ctx.clear();
        let mut free = self.free.lock();
        if free.len() < POOL_MAX {
            free.push(ctx);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

type Chain = Vec<Arc<dyn MessageListener>>;

#[derive(Default)]
pub struct ListenerRegistry {
    chains: RwLock<HashMap<MessageType, Chain>>,
    pool: ContextPool,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`. A listener already registered under
    /// the same name is replaced.
    pub fn add_listener(&self, kind: MessageType, listener: Arc<dyn MessageListener>) {
        let mut chains = self.chains.write();
        let chain = chains.entry(kind).or_default();
        chain.retain(|l| l.name() != listener.name());
        chain.push(listener);
        let ordered = order_chain(kind, std::mem::take(chain));
        debug!(
            %kind,
            chain = ?ordered.iter().map(|l| l.name()).collect::<Vec<_>>(),
            "message listener chain updated"
        );
        *chain = ordered;
    }

    pub fn remove_listener(&self, kind: MessageType, name: &str) -> bool {
        let mut chains = self.chains.write();
        let Some(chain) = chains.get_mut(&kind) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|l| l.name() != name);
        let removed = chain.len() != before;
        if chain.is_empty() {
            chains.remove(&kind);
        }
        removed
    }

    pub fn remove_all(&self, kind: MessageType) {
        self.chains.write().remove(&kind);
    }

    /// Ordered listener names per message type.
    pub fn listener_names(&self) -> BTreeMap<MessageType, Vec<String>> {
        self.chains
            .read()
            .iter()
            .map(|(kind, chain)| (*kind, chain.iter().map(|l| l.name().to_string()).collect()))
            .collect()
    }

    pub fn has_listeners(&self, kind: MessageType) -> bool {
        self.chains.read().get(&kind).is_some_and(|c| !c.is_empty())
    }

    fn chain(&self, kind: MessageType) -> Chain {
        self.chains.read().get(&kind).cloned().unwrap_or_default()
    }

    /// Run the chain for `frame`. With `ctx` the caller's context is used
    /// as-is; otherwise a pooled one is borrowed and returned cleared.
    /// Returns false when no listener is registered for the type or the
    /// message was rejected before dispatch.
    pub fn dispatch(
        &self,
        sw: &SwitchHandle,
        frame: &Frame,
        ctx: Option<&mut DispatchContext>,
    ) -> bool {
        let kind = frame.message_type();
        if let Message::PacketIn { data, .. } = &frame.msg {
            if data.is_empty() {
                error!(switch = %sw, "ignoring PACKET_IN with empty data");
                return false;
            }
        }

        let chain = self.chain(kind);
        if chain.is_empty() {
            warn!(switch = %sw, %kind, xid = frame.xid, "unhandled message");
            return false;
        }

        match ctx {
            Some(ctx) => run_chain(&chain, sw, frame, ctx),
            None => {
                let mut ctx = self.pool.acquire();
                run_chain(&chain, sw, frame, &mut ctx);
                self.pool.release(ctx);
            }
        }
        true
    }
}

fn run_chain(chain: &[Arc<dyn MessageListener>], sw: &SwitchHandle, frame: &Frame, ctx: &mut DispatchContext) {
    for listener in chain {
        if !listener.is_interested(sw) {
            trace!(listener = listener.name(), switch = %sw, "listener not interested");
            continue;
        }
        trace!(listener = listener.name(), kind = %frame.message_type(), "calling listener");
        match catch_unwind(AssertUnwindSafe(|| listener.receive(sw, frame, ctx))) {
            Ok(Command::Continue) => {}
            Ok(Command::Stop) => break,
            Err(_) => error!(
                listener = listener.name(),
                switch = %sw,
                kind = %frame.message_type(),
                "message listener panicked; continuing"
            ),
        }
    }
}

/// Topological sort over the before/after constraints. Ties, and the
/// remainder of any cycle, keep registration order.
fn order_chain(kind: MessageType, listeners: Chain) -> Chain {
    let n = listeners.len();
    let mut successors = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let (a, b) = (&listeners[i], &listeners[j]);
            if a.runs_before(kind, b.name()) || b.runs_after(kind, a.name()) {
                successors[i].push(j);
                indegree[j] += 1;
            }
        }
    }

    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        match (0..n).find(|&i| !placed[i] && indegree[i] == 0) {
            Some(i) => {
                placed[i] = true;
                order.push(i);
                for &j in &successors[i] {
                    indegree[j] -= 1;
                }
            }
            None => {
                warn!(%kind, "cyclic listener ordering constraints; using registration order for the rest");
                for (i, done) in placed.iter_mut().enumerate() {
                    if !*done {
                        *done = true;
                        order.push(i);
                    }
                }
            }
        }
    }
    order.into_iter().map(|i| listeners[i].clone()).collect()
}
