use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that end a single upload. None of them are retried; the caller
/// starts a new transfer from offset 0.
#[derive(Error, Debug)]
pub enum TransferError {
    /// File type or size outside what the service accepts
    #[error("unsupported file: {0}")]
    Unsupported(String),

    /// The channel was not open, or stopped being open mid-transfer
    #[error("connection is not open")]
    ConnectionNotOpen,

    /// Reading the source file failed
    #[error("failed to read payload: {0}")]
    ReadFailed(#[source] io::Error),

    /// The channel did not open within the wait window
    #[error("connection did not open within {0:?}")]
    OpenTimeout(Duration),
}

/// Channel-level failures. The reconnect loop recovers from these; they only
/// reach callers indirectly, as an `OpenTimeout`.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),

    #[error("websocket handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("websocket transport failed: {0}")]
    Transport(#[source] tungstenite::Error),

    #[error("connection closed by service")]
    ClosedByRemote,
}

/// An inbound text message that could not be decoded. Logged and dropped.
#[derive(Error, Debug)]
#[error("undecodable service message: {0}")]
pub struct ProtocolError(#[from] pub scribe_types::DecodeError);
