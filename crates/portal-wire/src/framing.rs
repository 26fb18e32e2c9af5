use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::wire::{
    decode_device_message, decode_server_message, encode_device_message, encode_server_message,
    DeviceMessage, ServerMessage, WireError,
};

/// Largest payload accepted in one frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Writes one `u32` big-endian length-prefixed frame and flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` on a clean end of stream between
/// frames.
///
/// Not cancel safe: dropping the future mid-frame loses the bytes already
/// read. Callers that need a deadline read on a dedicated task.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let read = reader.read(&mut header[filled..]).await?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        filled += read;
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        trace!(len, "rejecting oversized frame");
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn send_device_message<W>(writer: &mut W, message: &DeviceMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_device_message(message)?;
    write_frame(writer, &payload).await
}

pub async fn recv_device_message<R>(reader: &mut R) -> Result<Option<DeviceMessage>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(decode_device_message(&payload)?)),
        None => Ok(None),
    }
}

pub async fn send_server_message<W>(writer: &mut W, message: &ServerMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode_server_message(message)?;
    write_frame(writer, &payload).await
}

pub async fn recv_server_message<R>(reader: &mut R) -> Result<Option<ServerMessage>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(decode_server_message(&payload)?)),
        None => Ok(None),
    }
}
