//! Length-prefixed JSON framing for [`TransferMessage`]s.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON.

use crate::error::{SyncError, SyncResult};
use crate::protocol::TransferMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Serializes a message into a complete frame.
pub fn encode_frame(message: &TransferMessage) -> SyncResult<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(SyncError::TransferFailed(format!(
            "message too large: {} bytes",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads one length-prefixed JSON message.
pub async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> SyncResult<TransferMessage> {
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(SyncError::TransferFailed(format!(
            "message too large: {len} bytes"
        )));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Writes one length-prefixed JSON message and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    io: &mut W,
    message: &TransferMessage,
) -> SyncResult<()> {
    let frame = encode_frame(message)?;
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}
