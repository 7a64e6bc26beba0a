//! Length-prefixed framing
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.
//! Lengths above the reader's limit are rejected before any allocation.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IpcError;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(payload.len()).map_err(|_| IpcError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// Returns `ConnectionClosed` if the stream ends cleanly before a header.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Bytes, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Err(IpcError::ConnectionClosed)
            } else {
                Err(IpcError::IoError(format!(
                    "stream ended inside frame header after {} bytes",
                    filled
                )))
            };
        }
        filled += n;
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > max_frame_bytes {
        return Err(IpcError::FrameTooLarge {
            size,
            max: max_frame_bytes,
        });
    }

    let mut payload = BytesMut::zeroed(size);
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IpcError::IoError(format!("stream ended inside {}-byte frame", size))
        } else {
            IpcError::from(e)
        }
    })?;

    Ok(payload.freeze())
}

/// Serialize `message` as JSON and write it as one frame
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize + ?Sized,
{
    let payload =
        serde_json::to_vec(message).map_err(|e| IpcError::SerializationError(e.to_string()))?;
    write_frame(writer, &payload).await
}

/// Read one frame and decode it as JSON
pub async fn read_message<R, T>(reader: &mut R, max_frame_bytes: usize) -> Result<T, IpcError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let payload = read_frame(reader, max_frame_bytes).await?;
    serde_json::from_slice(&payload).map_err(|e| IpcError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CorrelationId, Request};
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_header_is_big_endian() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").await.unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_message_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request::new(CorrelationId(1), "ping", json!({"nonce": 9}));

        write_message(&mut client, &request).await.unwrap();
        let received: Request = read_message(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();

        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut raw: &[u8] = &[0, 0, 1, 0, 1, 2, 3];
        let err = read_frame(&mut raw, 16).await.unwrap_err();
        assert!(matches!(err, IpcError::FrameTooLarge { size: 256, max: 16 }));
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let mut raw: &[u8] = &[];
        let err = read_frame(&mut raw, 16).await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let mut raw: &[u8] = &[0, 0, 0, 8, b'x'];
        let err = read_frame(&mut raw, 16).await.unwrap_err();
        assert!(matches!(err, IpcError::IoError(_)));

        let mut header_only: &[u8] = &[0, 0];
        let err = read_frame(&mut header_only, 16).await.unwrap_err();
        assert!(matches!(err, IpcError::IoError(_)));
    }

    #[tokio::test]
    async fn test_invalid_json_is_deserialization_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{not json").await.unwrap();
        let mut raw: &[u8] = &buf;
        let err = read_message::<_, Request>(&mut raw, 64).await.unwrap_err();
        assert!(matches!(err, IpcError::DeserializationError(_)));
    }
}
