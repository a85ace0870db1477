//! Crate-wide error taxonomy.
//!
//! Mirrors the error categories in the spec's error handling design: parse,
//! protocol, timeout, connectivity, policy, cancellation, and unexpected.
//! Device-command failures are carried as plain `String` messages (they are
//! shown to operators verbatim), while this enum is reserved for errors that
//! abort a whole operation before any device command could be constructed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ActorError>;

#[derive(Debug, Error)]
pub enum ActorError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ActorError {
    /// The machine-parseable `Exception=<Kind>` hub message for unexpected
    /// errors surfaced from a verb handler (spec.md 4.7 / 7).
    pub fn exception_kind(&self) -> &'static str {
        match self {
            ActorError::Parse(_) => "ParseError",
            ActorError::Protocol(_) => "ProtocolError",
            ActorError::Timeout(_) => "TimeoutError",
            ActorError::NotConnected => "NotConnectedError",
            ActorError::Policy(_) => "PolicyError",
            ActorError::Cancelled(_) => "CancelledError",
            ActorError::UnknownDevice(_) => "UnknownDeviceError",
            ActorError::Io(_) => "IoError",
            ActorError::Config(_) => "ConfigError",
            ActorError::Unexpected(_) => "UnexpectedError",
        }
    }
}
