//! Per-connection message processing.
//!
//! A [`ChannelHandler`] is driven by exactly one task, in arrival order. It
//! runs the handshake, creates the switch record, routes role traffic to the
//! arbiter and everything else through the listener chain.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, error, info};

use crate::handshake::{Handshake, SwitchStateError};
use crate::mastership::{ReadyOutcome, RoleErrorOutcome};
use crate::protocol::{
    ErrorMsg, Features, Frame, Message, MessageType, Role, StatsReplyBody, StatsRequestBody, Xid,
};
use crate::switch::{SwitchConnection, SwitchHandle, SwitchRecord};

use super::{ChannelError, Controller};

pub struct ChannelHandler {
    controller: Controller,
    conn: Arc<dyn SwitchConnection>,
    handshake: Handshake,
    sw: Option<SwitchHandle>,
    description_rx: Option<oneshot::Receiver<StatsReplyBody>>,
    control_requested: bool,
    /// Transaction ids for messages sent before the record exists.
    next_xid: Xid,
}

impl ChannelHandler {
    pub(super) fn new(controller: Controller, conn: Arc<dyn SwitchConnection>) -> Self {
        Self {
            controller,
            conn,
            handshake: Handshake::new(),
            sw: None,
            description_rx: None,
            control_requested: false,
            next_xid: 1,
        }
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn is_ready(&self) -> bool {
        self.handshake.is_ready()
    }

    pub fn switch(&self) -> Option<&SwitchHandle> {
        self.sw.as_ref()
    }

    fn who(&self) -> String {
        match &self.sw {
            Some(sw) => sw.to_string(),
            None => format!("[{}]", self.conn.peer()),
        }
    }

    fn send(&mut self, msg: Message) -> Result<(), ChannelError> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        self.conn.send(Frame::new(xid, msg))?;
        Ok(())
    }

    fn require_switch(&self, message: &'static str) -> Result<SwitchHandle, ChannelError> {
        self.sw.clone().ok_or_else(|| {
            SwitchStateError {
                message,
                state: self.handshake.state(),
            }
            .into()
        })
    }

    /// Transport is up; say HELLO.
    pub fn channel_connected(&mut self) -> Result<(), ChannelError> {
        info!(peer = %self.conn.peer(), "new switch connection");
        let hello = self.handshake.on_connected();
        self.send(hello)
    }

    /// Nothing read for the idle interval; probe the switch. Once the
    /// record exists its xid space is the only one in use.
    pub fn channel_idle(&mut self) -> Result<(), ChannelError> {
        debug!(switch = %self.who(), "connection idle; sending echo request");
        match &self.sw {
            Some(sw) => {
                sw.write(Message::EchoRequest)?;
                Ok(())
            }
            None => self.send(Message::EchoRequest),
        }
    }

    /// Log `err` and close the connection if it calls for that. Returns
    /// whether the connection stays open.
    pub fn handle_error(&self, err: &ChannelError) -> bool {
        err.log(&self.who());
        if err.closes_connection() {
            self.conn.close();
            return false;
        }
        true
    }

    /// Process one inbound frame, handling any failure. Returns whether the
    /// connection stays open.
    pub async fn handle_frame(&mut self, frame: Frame) -> bool {
        match self.process_frame(frame).await {
            Ok(()) => !self.conn.is_closed(),
            Err(e) => self.handle_error(&e),
        }
    }

    pub async fn process_frame(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let mut dispatch = false;
        match &frame.msg {
            Message::Hello => {
                let reply = self.handshake.on_hello()?;
                self.send(reply)?;
            }
            Message::EchoRequest => {
                self.conn.send(Frame::new(frame.xid, Message::EchoReply))?;
            }
            Message::EchoReply => {}
            Message::FeaturesReply(features) => self.on_features_reply(features.clone())?,
            Message::GetConfigReply { miss_send_len } => {
                self.handshake.on_config_reply(*miss_send_len)?;
                self.check_ready().await?;
            }
            Message::StatsReply { body } => {
                self.handshake.on_stats_reply()?;
                let sw = self.require_switch("STATS_REPLY")?;
                sw.deliver_statistics_reply(frame.xid, body.clone());
                self.process_description();
                self.check_ready().await?;
            }
            Message::RoleReply { role } => {
                let sw = self.require_switch("ROLE_REPLY")?;
                self.controller
                    .arbiter()
                    .on_role_reply(&sw, &mut self.handshake, frame.xid, *role);
            }
            Message::Error(err) => {
                let outcome = match self.sw.clone() {
                    Some(sw) if self.handshake.is_ready() => self.controller.arbiter().on_role_error(
                        &sw,
                        &mut self.handshake,
                        frame.xid,
                        *err,
                    ),
                    _ => RoleErrorOutcome::NotRoleError,
                };
                if outcome == RoleErrorOutcome::NotRoleError {
                    self.log_switch_error(frame.xid, err);
                    dispatch = true;
                }
            }
            Message::PortStatus { reason, desc } => {
                let sw = self.require_switch("PORT_STATUS")?;
                self.controller
                    .arbiter()
                    .on_port_status(&sw, *reason, desc.clone());
                dispatch = true;
            }
            _ => dispatch = true,
        }

        if dispatch {
            self.dispatch(&frame);
        }
        Ok(())
    }

    fn on_features_reply(&mut self, features: Features) -> Result<(), ChannelError> {
        if !self.handshake.on_features_reply()? {
            if let Some(sw) = &self.sw {
                debug!(switch = %sw, "feature set refreshed");
                sw.set_features(features);
            }
            return Ok(());
        }
        let sw = SwitchRecord::new(features, self.conn.clone());
        info!(switch = %sw, ports = sw.ports().len(), "switch features received");
        for msg in Handshake::config_messages() {
            sw.write(msg)?;
        }
        self.description_rx = Some(sw.request_statistics(StatsRequestBody::Description)?);
        self.sw = Some(sw);
        Ok(())
    }

    /// Poll the pending description request without waiting.
    fn process_description(&mut self) {
        let Some(rx) = self.description_rx.as_mut() else {
            return;
        };
        match rx.try_recv() {
            Ok(StatsReplyBody::Description(description)) => {
                if let Some(sw) = &self.sw {
                    info!(
                        switch = %sw,
                        manufacturer = %description.manufacturer,
                        hardware = %description.hardware,
                        software = %description.software,
                        "switch description received"
                    );
                    sw.set_description(description);
                }
                self.handshake.on_description();
                self.description_rx = None;
            }
            Ok(other) => {
                error!(switch = %self.who(), reply = ?other, "description request answered with the wrong statistics");
                self.description_rx = None;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Closed) => {
                error!(switch = %self.who(), "description request cancelled");
                self.description_rx = None;
            }
        }
    }

    async fn check_ready(&mut self) -> Result<(), ChannelError> {
        if !self.handshake.check_ready() {
            return Ok(());
        }
        let sw = self.require_switch("handshake completion")?;
        info!(switch = %sw, "switch handshake complete");
        match self
            .controller
            .arbiter()
            .on_switch_ready(&sw, &mut self.handshake)
        {
            ReadyOutcome::ControlRequested => self.control_requested = true,
            ReadyOutcome::Promoted => {}
            ReadyOutcome::RegistryFailed(e) => {
                let pause = self.controller.settings().mastership.control_request_retry_yield;
                tokio::time::sleep(pause).await;
                return Err(ChannelError::Registry(e.to_string()));
            }
        }
        Ok(())
    }

    fn log_switch_error(&self, xid: Xid, err: &ErrorMsg) {
        error!(switch = %self.who(), xid, error = %err, "error reported by switch");
    }

    fn dispatch(&self, frame: &Frame) {
        let kind = frame.message_type();
        let Some(sw) = &self.sw else {
            debug!(peer = %self.conn.peer(), %kind, "message before switch identity is known; dropping");
            return;
        };
        let _guard = sw.listener_read();
        if !sw.is_connected() {
            debug!(switch = %sw, %kind, "switch disconnected; dropping message");
            return;
        }
        if !self.handshake.is_ready() {
            debug!(switch = %sw, %kind, state = %self.handshake.state(), "handshake incomplete; dropping message");
            return;
        }
        if sw.role() == Some(Role::Slave) {
            if kind != MessageType::PortStatus {
                debug!(switch = %sw, %kind, "switch is SLAVE; dropping message");
            }
            return;
        }
        if !self.controller.table().is_active(sw) {
            debug!(switch = %sw, %kind, "switch not active; dropping message");
            return;
        }
        self.controller.message_listeners().dispatch(sw, frame, None);
    }

    /// Connection is gone. Safe to call more than once.
    pub fn channel_disconnected(&mut self) {
        self.description_rx = None;
        let Some(sw) = self.sw.clone() else {
            info!(peer = %self.conn.peer(), "connection closed before handshake");
            return;
        };
        if self.handshake.is_ready() {
            self.controller
                .arbiter()
                .on_disconnect(&sw, self.control_requested);
            self.control_requested = false;
        }
        {
            let _guard = sw.listener_write();
            sw.set_connected(false);
        }
        sw.cancel_all_statistics_replies();
        if !self.conn.is_closed() {
            self.conn.close();
        }
        info!(switch = %sw, "switch disconnected");
    }
}
