//! Transport abstraction: a connection-managed, line-framed peer (spec.md
//! 4.1 "TCP Device Base"). Adapted from the teacher's byte-oriented
//! `Transport` trait (`core::transport::traits`) to the ASCII
//! newline-terminated framing this protocol family actually uses.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("not connected")]
    NotConnected,
}

/// A line-oriented transport to a single remote device. Implementations own
/// exactly one underlying connection; `writeLine` appends the line
/// terminator, and received lines arrive with their terminator already
/// stripped via `recv_line`.
#[async_trait]
pub trait LineTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send `line` with the terminator appended.
    async fn write_line(&self, line: &str) -> Result<(), TransportError>;

    /// Receive the next complete line (terminator stripped), waiting up to
    /// `timeout` if given. Returns `ConnectionLost` if the peer closes.
    async fn recv_line(&self, timeout: Option<Duration>) -> Result<String, TransportError>;

    async fn is_connected(&self) -> bool;
    async fn connection_state(&self) -> ConnectionState;
}
