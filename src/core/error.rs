//! Process-level error types.
//!
//! Per-connection failures have their own taxonomy in
//! [`crate::controller::ChannelError`]; this enum covers startup and the
//! things that can stop the whole controller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
