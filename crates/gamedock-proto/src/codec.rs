//! Length-prefixed JSON framing over an async byte stream.
//!
//! Each envelope is preceded by a 4-byte big-endian length. The length is
//! validated against [`MAX_FRAME_SIZE`](crate::MAX_FRAME_SIZE) before any
//! allocation so an attacker-supplied prefix cannot balloon memory.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;
use crate::message::Envelope;

/// Read one framed envelope.
///
/// Returns [`ProtoError::ConnectionClosed`] on clean EOF between frames.
///
/// # Errors
///
/// Fails on oversized frames, malformed JSON, or transport errors.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtoError::ConnectionClosed);
        }
        Err(e) => return Err(ProtoError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > crate::MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge {
            actual: len,
            max: crate::MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtoError::ConnectionClosed,
            _ => ProtoError::Io(e),
        })?;

    Ok(serde_json::from_slice(&body)?)
}

/// Write one framed envelope and flush.
///
/// # Errors
///
/// Fails if the serialized envelope exceeds the frame limit or the
/// transport write fails.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(envelope)?;
    if body.len() > crate::MAX_FRAME_SIZE {
        return Err(ProtoError::FrameTooLarge {
            actual: body.len(),
            max: crate::MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
