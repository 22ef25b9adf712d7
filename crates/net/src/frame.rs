//! Length-prefixed frame encoding/decoding
//!
//! Each frame is a 4-byte big-endian payload length followed by that many
//! bytes of JSON. Payloads above 1MiB are refused in both directions.
//!
//! The codec is direction-agnostic: the hub reads
//! [`ClientFrame`](crate::protocol::ClientFrame) and the client reads
//! [`ServerFrame`](crate::protocol::ServerFrame). A payload that decodes
//! to garbage is a protocol error, but the length prefix has already been
//! consumed in full, so the stream stays aligned and the caller may keep
//! reading frames after it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on a single frame's payload
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Shared size guard for both directions
fn ensure_within_limit(size: usize) -> Result<()> {
    if size > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!(
            "frame of {size} bytes exceeds the {MAX_FRAME_BYTES}-byte limit"
        )));
    }
    Ok(())
}

/// A clean EOF means the peer hung up; anything else is a real IO fault.
fn classify_read_failure(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read the next frame off a stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    reader
        .read_exact(&mut header)
        .await
        .map_err(classify_read_failure)?;

    let size = u32::from_be_bytes(header) as usize;
    if size == 0 {
        return Err(Error::Protocol("zero-length frame".into()));
    }
    ensure_within_limit(size)?;

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .map_err(classify_read_failure)?;

    serde_json::from_slice(&body).map_err(|e| Error::Protocol(format!("undecodable frame: {e}")))
}

/// Encode a frame and push it onto a stream, flushing when done
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body =
        serde_json::to_vec(frame).map_err(|e| Error::Protocol(format!("unencodable frame: {e}")))?;
    ensure_within_limit(body.len())?;

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientFrame, ServerFrame};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = ClientFrame::Ping;

        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: ClientFrame = read_frame(&mut cursor).await.unwrap();

        assert!(matches!(decoded, ClientFrame::Ping));
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        // 4 zero bytes = length 0
        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        let result: Result<ClientFrame> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        // A header advertising one byte past the cap, with no payload
        // behind it; the size guard fires before any body read.
        let header = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes();
        let mut cursor = Cursor::new(header.to_vec());
        let result: Result<ServerFrame> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_eof_maps_to_connection_closed() {
        let mut cursor = Cursor::new(Vec::new());
        let result: Result<ClientFrame> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_stream_stays_aligned_after_bad_payload() {
        // A garbage frame followed by a valid one.
        let mut buf = Vec::new();
        let garbage = b"not json";
        buf.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        buf.extend_from_slice(garbage);
        write_frame(&mut buf, &ClientFrame::Ping).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let first: Result<ClientFrame> = read_frame(&mut cursor).await;
        assert!(matches!(first, Err(Error::Protocol(_))));

        let second: ClientFrame = read_frame(&mut cursor).await.unwrap();
        assert!(matches!(second, ClientFrame::Ping));
    }
}
