//! Per-connection handshake state machine.
//!
//! `START -> HELLO_SENT -> FEATURES_REPLY -> READY`, never backwards. The
//! FEATURES_REPLY -> READY edge needs both the switch description and the
//! config reply, which may arrive in either order. Nothing here touches the
//! transport: callers feed events in and send whatever comes back out.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{MISS_SEND_LEN_MAX, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Start,
    HelloSent,
    FeaturesReply,
    Ready,
}

impl HandshakeState {
    fn rank(self) -> u8 {
        match self {
            HandshakeState::Start => 0,
            HandshakeState::HelloSent => 1,
            HandshakeState::FeaturesReply => 2,
            HandshakeState::Ready => 3,
        }
    }
}

impl PartialOrd for HandshakeState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HandshakeState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandshakeState::Start => "START",
            HandshakeState::HelloSent => "HELLO_SENT",
            HandshakeState::FeaturesReply => "FEATURES_REPLY",
            HandshakeState::Ready => "READY",
        })
    }
}

/// A message arrived that the current handshake state does not allow.
#[derive(Debug, Error)]
#[error("unexpected {message} in state {state}")]
pub struct SwitchStateError {
    pub message: &'static str,
    pub state: HandshakeState,
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    has_description: bool,
    has_config_reply: bool,
    first_role_reply_received: bool,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Start,
            has_description: false,
            has_config_reply: false,
            first_role_reply_received: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    pub fn has_description(&self) -> bool {
        self.has_description
    }

    pub fn has_config_reply(&self) -> bool {
        self.has_config_reply
    }

    pub fn first_role_reply_received(&self) -> bool {
        self.first_role_reply_received
    }

    /// Also set when role support is off, so later role logic treats the
    /// switch as already past its first reply.
    pub fn mark_first_role_reply(&mut self) {
        self.first_role_reply_received = true;
    }

    fn advance(&mut self, next: HandshakeState) {
        debug_assert!(next > self.state, "handshake moved from {} to {next}", self.state);
        if next > self.state {
            debug!(from = %self.state, to = %next, "handshake advanced");
            self.state = next;
        }
    }

    fn unexpected(&self, message: &'static str) -> SwitchStateError {
        SwitchStateError {
            message,
            state: self.state,
        }
    }

    /// Transport connected; the controller speaks first.
    pub fn on_connected(&self) -> Message {
        Message::Hello
    }

    /// Peer HELLO. Returns the features request to send.
    pub fn on_hello(&mut self) -> Result<Message, SwitchStateError> {
        if self.state != HandshakeState::Start {
            return Err(self.unexpected("HELLO"));
        }
        self.advance(HandshakeState::HelloSent);
        Ok(Message::FeaturesRequest)
    }

    /// FEATURES_REPLY. `Ok(true)` on the handshake reply, after which the
    /// caller sends [`Handshake::config_messages`] and a description
    /// request. `Ok(false)` is a later refresh of the feature set.
    pub fn on_features_reply(&mut self) -> Result<bool, SwitchStateError> {
        match self.state {
            HandshakeState::Start => Err(self.unexpected("FEATURES_REPLY")),
            HandshakeState::HelloSent => {
                self.advance(HandshakeState::FeaturesReply);
                Ok(true)
            }
            HandshakeState::FeaturesReply | HandshakeState::Ready => Ok(false),
        }
    }

    /// Messages sent right after the handshake FEATURES_REPLY.
    pub fn config_messages() -> [Message; 2] {
        [
            Message::SetConfig {
                miss_send_len: MISS_SEND_LEN_MAX,
            },
            Message::GetConfigRequest,
        ]
    }

    /// GET_CONFIG_REPLY. A short `miss_send_len` is logged, not fatal.
    pub fn on_config_reply(&mut self, miss_send_len: u16) -> Result<(), SwitchStateError> {
        if self.state != HandshakeState::FeaturesReply {
            return Err(self.unexpected("GET_CONFIG_REPLY"));
        }
        if miss_send_len != MISS_SEND_LEN_MAX {
            warn!(
                miss_send_len,
                expected = MISS_SEND_LEN_MAX,
                "switch did not accept the requested miss send length"
            );
        }
        self.has_config_reply = true;
        Ok(())
    }

    /// STATS_REPLY arrived; only legal once features are known.
    pub fn on_stats_reply(&self) -> Result<(), SwitchStateError> {
        if self.state < HandshakeState::FeaturesReply {
            return Err(self.unexpected("STATS_REPLY"));
        }
        Ok(())
    }

    pub fn on_description(&mut self) {
        self.has_description = true;
    }

    /// Take the FEATURES_REPLY -> READY edge if both prerequisites are in.
    /// Returns true only on the call that makes the transition.
    pub fn check_ready(&mut self) -> bool {
        if self.state == HandshakeState::FeaturesReply && self.has_description && self.has_config_reply
        {
            self.advance(HandshakeState::Ready);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_features() -> Handshake {
        let mut hs = Handshake::new();
        hs.on_hello().unwrap();
        assert!(hs.on_features_reply().unwrap());
        hs
    }

    #[test]
    fn states_are_ordered() {
        assert!(HandshakeState::Start < HandshakeState::HelloSent);
        assert!(HandshakeState::HelloSent < HandshakeState::FeaturesReply);
        assert!(HandshakeState::FeaturesReply < HandshakeState::Ready);
    }

    #[test]
    fn hello_moves_to_hello_sent() {
        let mut hs = Handshake::new();
        assert_eq!(hs.on_connected(), Message::Hello);
        assert_eq!(hs.on_hello().unwrap(), Message::FeaturesRequest);
        assert_eq!(hs.state(), HandshakeState::HelloSent);
    }

    #[test]
    fn second_hello_is_a_state_error() {
        let mut hs = Handshake::new();
        hs.on_hello().unwrap();
        let err = hs.on_hello().unwrap_err();
        assert_eq!(err.state, HandshakeState::HelloSent);
        assert!(err.to_string().contains("HELLO"));
    }

    #[test]
    fn features_before_hello_is_a_state_error() {
        let mut hs = Handshake::new();
        assert!(hs.on_features_reply().is_err());
        assert_eq!(hs.state(), HandshakeState::Start);
    }

    #[test]
    fn config_reply_requires_features_state() {
        let mut hs = Handshake::new();
        hs.on_hello().unwrap();
        assert!(hs.on_config_reply(MISS_SEND_LEN_MAX).is_err());
    }

    #[test]
    fn stats_reply_requires_features_state() {
        let mut hs = Handshake::new();
        assert!(hs.on_stats_reply().is_err());
        hs.on_hello().unwrap();
        assert!(hs.on_stats_reply().is_err());
        hs.on_features_reply().unwrap();
        assert!(hs.on_stats_reply().is_ok());
    }

    #[test]
    fn ready_after_description_then_config() {
        let mut hs = to_features();
        hs.on_description();
        assert!(!hs.check_ready());
        hs.on_config_reply(MISS_SEND_LEN_MAX).unwrap();
        assert!(hs.check_ready());
        assert!(hs.is_ready());
    }

    #[test]
    fn ready_after_config_then_description() {
        let mut hs = to_features();
        hs.on_config_reply(MISS_SEND_LEN_MAX).unwrap();
        assert!(!hs.check_ready());
        hs.on_description();
        assert!(hs.check_ready());
        assert!(hs.is_ready());
    }

    #[test]
    fn short_miss_send_len_still_reaches_ready() {
        let mut hs = to_features();
        hs.on_config_reply(128).unwrap();
        hs.on_description();
        assert!(hs.check_ready());
    }

    #[test]
    fn check_ready_fires_once() {
        let mut hs = to_features();
        hs.on_config_reply(MISS_SEND_LEN_MAX).unwrap();
        hs.on_description();
        assert!(hs.check_ready());
        assert!(!hs.check_ready());
        assert!(hs.is_ready());
    }

    #[test]
    fn features_refresh_after_ready_is_not_an_error() {
        let mut hs = to_features();
        hs.on_config_reply(MISS_SEND_LEN_MAX).unwrap();
        hs.on_description();
        hs.check_ready();
        assert!(!hs.on_features_reply().unwrap());
        assert!(hs.is_ready());
    }

    #[test]
    fn state_never_decreases_across_event_sequences() {
        // Every ordering of the post-features events, with stray repeats.
        let sequences: [&[u8]; 4] = [&[0, 1, 2, 3], &[0, 2, 1, 3], &[0, 0, 1, 2], &[1, 0, 2, 2]];
        for seq in sequences {
            let mut hs = Handshake::new();
            let mut last = hs.state();
            for step in [9u8].iter().chain(seq.iter()) {
                match step {
                    9 => {
                        let _ = hs.on_hello();
                        let _ = hs.on_features_reply();
                    }
                    0 => hs.on_description(),
                    1 => {
                        let _ = hs.on_config_reply(MISS_SEND_LEN_MAX);
                    }
                    2 => {
                        hs.check_ready();
                    }
                    _ => {
                        let _ = hs.on_features_reply();
                    }
                }
                assert!(hs.state() >= last, "state went backwards in {seq:?}");
                last = hs.state();
            }
        }
    }
}
