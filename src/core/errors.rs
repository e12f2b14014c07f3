//! Error taxonomy shared across the core.
//!
//! Startup failures ([`CoreError`]) propagate to the caller of `start()`.
//! Everything that happens on the packet path is either dropped and counted
//! ([`DecodeError`]) or confined to the handler that produced it
//! ([`HandlerError`]); neither ever tears down the dispatcher.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Failures opening or driving the capture handle.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("interface {0:?} is not available")]
    InterfaceUnavailable(String),

    #[error("raw access to {0:?} was refused")]
    PermissionDenied(String),

    #[error("invalid capture filter {filter:?}: {reason}")]
    BadFilter { filter: String, reason: String },

    /// The engine was shut down while an operation was in flight.
    #[error("capture handle closed")]
    Closed,

    #[error("capture backend: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A malformed inbound frame. Always dropped and counted, never fatal.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame truncated inside {0} layer")]
    Truncated(&'static str),

    #[error("unsupported {what} {value:#x}")]
    Unsupported { what: &'static str, value: u32 },
}

/// A handler failed on one frame. Logged and counted by the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HandlerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Top-level error for lifecycle operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("simulator is already running")]
    AlreadyRunning,

    #[error("simulator is not running")]
    NotRunning,

    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
