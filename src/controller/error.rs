//! Connection-level failures and how each one is handled.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::handshake::SwitchStateError;
use crate::protocol::codec::CodecError;
use crate::switch::SendError;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("read timeout")]
    ReadTimeout,

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    /// Write raced with a close. Benign.
    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(String),

    #[error(transparent)]
    SwitchState(#[from] SwitchStateError),

    #[error("parse error: {0}")]
    Parse(String),

    /// Inbound queue overflow; the message was dropped.
    #[error("inbound queue full")]
    QueueFull,

    #[error("could not request control: {0}")]
    Registry(String),
}

impl From<SendError> for ChannelError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Closed => ChannelError::Closed,
        }
    }
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        ChannelError::Parse(e.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io(e.to_string())
    }
}

impl ChannelError {
    pub fn closes_connection(&self) -> bool {
        !matches!(self, ChannelError::QueueFull)
    }

    /// Log at the level this kind of failure deserves. `who` names the
    /// connection.
    pub fn log(&self, who: &str) {
        match self {
            ChannelError::ReadTimeout => error!(switch = who, "disconnecting switch due to read timeout"),
            ChannelError::HandshakeTimeout => {
                error!(switch = who, "disconnecting switch; handshake timed out")
            }
            ChannelError::Closed => debug!(switch = who, "channel already closed"),
            ChannelError::Io(e) => error!(switch = who, error = %e, "disconnecting switch due to io error"),
            ChannelError::SwitchState(e) => {
                error!(switch = who, error = %e, "protocol violation; disconnecting switch")
            }
            ChannelError::Parse(e) => {
                error!(switch = who, error = %e, "malformed message; disconnecting switch")
            }
            ChannelError::QueueFull => warn!(switch = who, "could not process message: queue full"),
            ChannelError::Registry(e) => {
                debug!(switch = who, error = %e, "closing connection after control request failure")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeState;

    #[test]
    fn only_queue_full_keeps_connection() {
        assert!(!ChannelError::QueueFull.closes_connection());
        assert!(ChannelError::Closed.closes_connection());
        assert!(ChannelError::ReadTimeout.closes_connection());
        assert!(ChannelError::Parse("x".into()).closes_connection());
    }

    #[test]
    fn state_error_converts() {
        let e: ChannelError = SwitchStateError {
            message: "HELLO",
            state: HandshakeState::Ready,
        }
        .into();
        assert!(e.to_string().contains("unexpected HELLO in state READY"));
    }

    #[test]
    fn send_error_maps_to_closed() {
        assert!(matches!(ChannelError::from(SendError::Closed), ChannelError::Closed));
    }
}
