//! Length-prefixed framing for the control plane.
//!
//! Frames are 4-byte big-endian length + UTF-8 JSON body. Payload streams
//! (game files, weight blobs) follow their announcing frame and carry their
//! own 4-byte big-endian length prefix.

use std::path::Path;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::protocol::ProtocolError;

/// Maximum allowed JSON frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum allowed payload stream size (1 GB).
pub const MAX_PAYLOAD_SIZE: u64 = 1024 * 1024 * 1024;

const COPY_CHUNK: usize = 64 * 1024;

/// Read a length-prefixed frame from an async reader.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = vec![0u8; frame_len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a payload stream (length prefix + raw bytes).
pub async fn write_payload<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let len = data.len() as u64;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_payload_len<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<u64, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from(u32::from_be_bytes(len_buf));
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(len)
}

/// Read a complete payload stream into memory.
pub async fn read_payload<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, ProtocolError> {
    let len = read_payload_len(reader).await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Stream a payload to a file, creating parent directories as needed.
///
/// Returns the number of bytes written.
pub async fn receive_payload_to_file<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    path: &Path,
) -> Result<u64, ProtocolError> {
    let len = read_payload_len(reader).await?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(path).await?;
    copy_exact(reader, &mut file, len).await?;
    file.flush().await?;
    Ok(len)
}

/// Consume a payload stream without keeping the bytes.
///
/// Used when a row budget rejects the data but the socket must stay in sync.
pub async fn discard_payload<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<u64, ProtocolError> {
    let len = read_payload_len(reader).await?;
    let mut sink = tokio::io::sink();
    copy_exact(reader, &mut sink, len).await?;
    Ok(len)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, mut remaining: u64) -> Result<(), ProtocolError>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut chunk = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let take = remaining.min(COPY_CHUNK as u64) as usize;
        reader.read_exact(&mut chunk[..take]).await?;
        writer.write_all(&chunk[..take]).await?;
        remaining -= take as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{\"type\":\"ready\"}").await.unwrap();
        assert_eq!(&buf[..4], &16u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, b"{\"type\":\"ready\"}");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn payload_roundtrip() {
        let data = vec![7u8; 200_000];
        let mut buf = Vec::new();
        write_payload(&mut buf, &data).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let out = read_payload(&mut cursor).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn discard_consumes_exactly_one_payload() {
        let mut buf = Vec::new();
        write_payload(&mut buf, &[1u8; 1000]).await.unwrap();
        write_frame(&mut buf, b"{\"type\":\"done\"}").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let n = discard_payload(&mut cursor).await.unwrap();
        assert_eq!(n, 1000);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, b"{\"type\":\"done\"}");
    }

    #[tokio::test]
    async fn payload_to_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client-3/gen-2/171000.log");

        let mut buf = Vec::new();
        write_payload(&mut buf, b"game bytes").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);

        let n = receive_payload_to_file(&mut cursor, &path).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"game bytes");
    }
}
