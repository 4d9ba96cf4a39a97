use std::io::{Read, Write};

#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// 4-byte identifier every nsqd connection must write before framing begins.
pub const MAGIC: [u8; 4] = *b"  V2";

/// Default cap on a single frame's payload, guarding against a malformed or
/// hostile peer claiming an unbounded size.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Response,
    Error,
    Message,
}

impl FrameType {
    fn from_u32(value: u32) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(FrameType::Response),
            1 => Ok(FrameType::Error),
            2 => Ok(FrameType::Message),
            other => Err(ProtoError::UnknownFrameType(other)),
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            FrameType::Response => 0,
            FrameType::Error => 1,
            FrameType::Message => 2,
        }
    }
}

/// Writes `MAGIC` synchronously. Call once, immediately after connecting.
pub fn write_magic_sync<W: Write>(writer: &mut W) -> Result<(), ProtoError> {
    writer.write_all(&MAGIC)?;
    Ok(())
}

#[cfg(feature = "tokio")]
pub async fn write_magic_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
) -> Result<(), ProtoError> {
    writer.write_all(&MAGIC).await?;
    Ok(())
}

/// Reads one frame: `[size: u32be][type: u32be][payload]`, where `size`
/// counts the type field plus payload. Rejects frames over `max_frame_size`.
pub fn read_frame_sync<R: Read>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<(FrameType, Vec<u8>), ProtoError> {
    let mut size_buf = [0_u8; 4];
    reader.read_exact(&mut size_buf)?;
    let size = u32::from_be_bytes(size_buf);
    if size < 4 || size > max_frame_size {
        return Err(ProtoError::FrameTooLarge(size, max_frame_size));
    }

    let mut type_buf = [0_u8; 4];
    reader.read_exact(&mut type_buf)?;
    let frame_type = FrameType::from_u32(u32::from_be_bytes(type_buf))?;

    let payload_len = (size - 4) as usize;
    let mut payload = vec![0_u8; payload_len];
    reader.read_exact(&mut payload)?;

    Ok((frame_type, payload))
}

pub fn write_frame_sync<W: Write>(
    writer: &mut W,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<(), ProtoError> {
    let size = u32::try_from(payload.len() + 4)
        .map_err(|_| ProtoError::FrameTooLarge(u32::MAX, u32::MAX))?;
    writer.write_all(&size.to_be_bytes())?;
    writer.write_all(&frame_type.as_u32().to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

#[cfg(feature = "tokio")]
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<(FrameType, Vec<u8>), ProtoError> {
    let mut size_buf = [0_u8; 4];
    reader.read_exact(&mut size_buf).await?;
    let size = u32::from_be_bytes(size_buf);
    if size < 4 || size > max_frame_size {
        return Err(ProtoError::FrameTooLarge(size, max_frame_size));
    }

    let mut type_buf = [0_u8; 4];
    reader.read_exact(&mut type_buf).await?;
    let frame_type = FrameType::from_u32(u32::from_be_bytes(type_buf))?;

    let payload_len = (size - 4) as usize;
    let mut payload = vec![0_u8; payload_len];
    reader.read_exact(&mut payload).await?;

    Ok((frame_type, payload))
}

#[cfg(feature = "tokio")]
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<(), ProtoError> {
    let size = u32::try_from(payload.len() + 4)
        .map_err(|_| ProtoError::FrameTooLarge(u32::MAX, u32::MAX))?;
    writer.write_all(&size.to_be_bytes()).await?;
    writer.write_all(&frame_type.as_u32().to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_response_frame() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, FrameType::Response, b"OK").unwrap();

        let mut cursor = &buf[..];
        let (frame_type, payload) =
            read_frame_sync(&mut cursor, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(frame_type, FrameType::Response);
        assert_eq!(payload, b"OK");
    }

    #[test]
    fn round_trips_empty_payload() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, FrameType::Message, b"").unwrap();

        let mut cursor = &buf[..];
        let (frame_type, payload) =
            read_frame_sync(&mut cursor, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(frame_type, FrameType::Message);
        assert!(payload.is_empty());
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, FrameType::Error, &vec![0_u8; 64]).unwrap();

        let mut cursor = &buf[..];
        let err = read_frame_sync(&mut cursor, 16).unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge(_, _)));
    }

    #[test]
    fn rejects_truncated_frame() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, FrameType::Response, b"hello").unwrap();
        buf.truncate(buf.len() - 2);

        let mut cursor = &buf[..];
        let err = read_frame_sync(&mut cursor, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ProtoError::Io(_)));
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8_u32.to_be_bytes());
        buf.extend_from_slice(&99_u32.to_be_bytes());

        let mut cursor = &buf[..];
        let err = read_frame_sync(&mut cursor, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownFrameType(99)));
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn async_round_trip_matches_sync() {
        let mut buf = Vec::new();
        write_frame_async(&mut buf, FrameType::Message, b"payload")
            .await
            .unwrap();

        let mut cursor = &buf[..];
        let (frame_type, payload) =
            read_frame_async(&mut cursor, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        assert_eq!(frame_type, FrameType::Message);
        assert_eq!(payload, b"payload");
    }
}
