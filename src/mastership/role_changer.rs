//! Outbound role requests.
//!
//! Requests are fire-and-forget: each switch gets its own transaction id,
//! remembered on the record so the reply (or error) can be matched later.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{Frame, Message, Role, SwitchId, Xid};
use crate::switch::{PendingRole, SwitchHandle};

use super::Arbiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent(Xid),
    /// The switch already told us it does not understand roles.
    Unsupported,
    Disconnected,
    /// The write failed; the connection is on its way down.
    Failed,
}

/// One batch of role requests sharing a desired role.
#[derive(Debug, Clone)]
pub struct RoleRequest {
    pub role: Role,
    pub issued_at: Instant,
    pub outcomes: Vec<(SwitchId, SubmitOutcome)>,
}

impl RoleRequest {
    pub fn outcome(&self, id: SwitchId) -> Option<SubmitOutcome> {
        self.outcomes.iter().find(|(i, _)| *i == id).map(|(_, o)| *o)
    }
}

#[derive(Debug, Default)]
pub struct RoleChanger;

impl RoleChanger {
    pub fn new() -> Self {
        Self
    }

    pub fn submit_request(&self, switches: &[SwitchHandle], role: Role) -> RoleRequest {
        let issued_at = Instant::now();
        let outcomes = switches
            .iter()
            .map(|sw| (sw.id(), self.send_role_request(sw, role, issued_at)))
            .collect();
        RoleRequest {
            role,
            issued_at,
            outcomes,
        }
    }

    fn send_role_request(&self, sw: &SwitchHandle, role: Role, issued_at: Instant) -> SubmitOutcome {
        if !sw.is_connected() {
            debug!(switch = %sw, %role, "not sending role request to disconnected switch");
            return SubmitOutcome::Disconnected;
        }
        if sw.roles_supported() == Some(false) {
            debug!(switch = %sw, %role, "switch does not support roles");
            return SubmitOutcome::Unsupported;
        }
        let xid = sw.next_xid();
        sw.push_pending_role(PendingRole {
            xid,
            role,
            issued_at,
        });
        match sw.write_frame(Frame::new(xid, Message::RoleRequest { role })) {
            Ok(()) => {
                debug!(switch = %sw, %role, xid, "role request sent");
                SubmitOutcome::Sent(xid)
            }
            Err(e) => {
                debug!(switch = %sw, %role, error = %e, "role request not sent");
                SubmitOutcome::Failed
            }
        }
    }
}

/// Periodically close connections whose oldest role request has gone
/// unanswered for longer than `timeout`.
pub async fn run_timeout_sweeper(arbiter: Arc<Arbiter>, timeout: Duration, shutdown: CancellationToken) {
    let period = (timeout / 2).max(Duration::from_millis(50));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(timeout_ms = timeout.as_millis() as u64, "role request sweeper started");
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("role request sweeper shutting down");
                break;
            }

            _ = ticker.tick() => {
                let expired = arbiter.expire_role_requests(timeout, Instant::now());
                if !expired.is_empty() {
                    warn!(count = expired.len(), "closed switches with unanswered role requests");
                }
            }
        }
    }
}
