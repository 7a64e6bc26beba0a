//! IPC error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A complete frame whose payload is not the expected message.
    /// The stream stays aligned on frame boundaries.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// Peer closed the stream at a frame boundary
    #[error("Connection closed")]
    ConnectionClosed,

    /// Announced frame length exceeds the configured maximum
    #[error("Frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Well-formed frame that breaks the request/response contract
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The pipe was already closed on this side
    #[error("Transport not connected")]
    NotConnected,
}

impl IpcError {
    /// Whether the peer is gone, as opposed to having sent something unusable
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            IpcError::ConnectionClosed | IpcError::IoError(_) | IpcError::NotConnected
        )
    }

    /// Whether the next frame can still be read from this stream
    pub fn stream_usable(&self) -> bool {
        matches!(
            self,
            IpcError::DeserializationError(_) | IpcError::SerializationError(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe => IpcError::ConnectionClosed,
            _ => IpcError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}
