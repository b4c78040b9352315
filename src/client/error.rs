use std::io;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced to callers of the unprivileged client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No daemon reachable, or the client is not connected.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The daemon closed the connection or answered with an unexpected frame
    /// during the handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The daemon rejected our protocol version, or reported a different one.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The daemon sent nothing within the handshake timeout.
    #[error("timed out waiting for the daemon")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
