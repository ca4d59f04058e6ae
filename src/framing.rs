//! # Multipart Frame Codec
//!
//! ZeroMQ-style multipart messages over a TCP byte stream. Each frame is
//! `[flags: u8][length: u32 BE][payload]`; the MORE bit on flags chains
//! frames into one multipart message. All reads are bounded: a peer cannot
//! force an oversized allocation or an unbounded frame chain.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::MAX_BODY_SIZE;

/// Flag bit: more frames follow in this multipart message.
const FLAG_MORE: u8 = 0x01;

/// Maximum size of a single frame. Sized for the largest envelope body
/// plus codec overhead.
pub const MAX_FRAME_SIZE: usize = MAX_BODY_SIZE + 4096;

/// Maximum frames in one multipart message. The envelope needs seven;
/// headroom for protocol evolution.
pub const MAX_FRAMES_PER_MESSAGE: usize = 16;

/// Write one multipart message and flush.
pub async fn write_multipart<W>(writer: &mut W, frames: &[Vec<u8>]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() {
        bail!("cannot write an empty multipart message");
    }
    if frames.len() > MAX_FRAMES_PER_MESSAGE {
        bail!(
            "multipart message has {} frames (max {})",
            frames.len(),
            MAX_FRAMES_PER_MESSAGE
        );
    }
    for (idx, frame) in frames.iter().enumerate() {
        if frame.len() > MAX_FRAME_SIZE {
            bail!("frame of {} bytes exceeds max {}", frame.len(), MAX_FRAME_SIZE);
        }
        let flags = if idx + 1 < frames.len() { FLAG_MORE } else { 0 };
        writer.write_u8(flags).await.context("write frame flags")?;
        writer
            .write_u32(frame.len() as u32)
            .await
            .context("write frame length")?;
        writer.write_all(frame).await.context("write frame payload")?;
    }
    writer.flush().await.context("flush multipart message")?;
    Ok(())
}

/// Read one multipart message. Errors on EOF, oversized frames, or an
/// overlong frame chain; the connection should be dropped on error.
pub async fn read_multipart<R>(reader: &mut R) -> Result<Vec<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut frames = Vec::new();
    loop {
        let flags = reader.read_u8().await.context("read frame flags")?;
        let len = reader.read_u32().await.context("read frame length")? as usize;
        if len > MAX_FRAME_SIZE {
            bail!("peer sent frame of {} bytes (max {})", len, MAX_FRAME_SIZE);
        }
        if frames.len() == MAX_FRAMES_PER_MESSAGE {
            bail!("peer sent more than {} frames", MAX_FRAMES_PER_MESSAGE);
        }
        let mut frame = vec![0u8; len];
        reader
            .read_exact(&mut frame)
            .await
            .context("read frame payload")?;
        frames.push(frame);
        if flags & FLAG_MORE == 0 {
            return Ok(frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn round_trip_multipart() {
        let frames = vec![Vec::new(), b"version".to_vec(), vec![0x01], b"body".to_vec()];
        let mut buf = Vec::new();
        write_multipart(&mut buf, &frames).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let read = read_multipart(&mut cursor).await.unwrap();
        assert_eq!(read, frames);
    }

    #[tokio::test]
    async fn consecutive_messages_read_in_order() {
        let first = vec![b"one".to_vec()];
        let second = vec![b"two".to_vec(), b"frames".to_vec()];
        let mut buf = Vec::new();
        write_multipart(&mut buf, &first).await.unwrap();
        write_multipart(&mut buf, &second).await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_multipart(&mut cursor).await.unwrap(), first);
        assert_eq!(read_multipart(&mut cursor).await.unwrap(), second);
    }

    #[tokio::test]
    async fn oversized_frame_length_rejected() {
        let mut buf = Vec::new();
        buf.push(0u8);
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        assert!(read_multipart(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn truncated_payload_errors() {
        let mut buf = Vec::new();
        buf.push(0u8);
        buf.extend_from_slice(&16u32.to_be_bytes());
        buf.extend_from_slice(b"short");

        let mut cursor = Cursor::new(buf);
        assert!(read_multipart(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn empty_multipart_write_rejected() {
        let mut buf = Vec::new();
        assert!(write_multipart(&mut buf, &[]).await.is_err());
    }

    #[tokio::test]
    async fn frame_chain_bound_enforced() {
        let mut buf = Vec::new();
        for _ in 0..MAX_FRAMES_PER_MESSAGE + 1 {
            buf.push(FLAG_MORE);
            buf.extend_from_slice(&0u32.to_be_bytes());
        }
        let mut cursor = Cursor::new(buf);
        assert!(read_multipart(&mut cursor).await.is_err());
    }
}
