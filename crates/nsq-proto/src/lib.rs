pub mod command;
pub mod error;
pub mod frame;
pub mod identify;

pub use error::ProtoError;
pub use frame::{DEFAULT_MAX_FRAME_SIZE, FrameType, MAGIC};
pub use identify::{IdentifyRequest, IdentifyResponse};

/// Body of a `heartbeat` response frame; never a real command reply.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Body of a successful in-band command response.
pub const OK: &[u8] = b"OK";

/// Decodes a `Message` frame payload: `i64be ts_ns | u16be attempts | 16B id | body`.
pub fn decode_message_payload(
    payload: &[u8]
) -> Result<(i64, u16, [u8; 16], &[u8]), ProtoError> {
    if payload.len() < 26 {
        return Err(ProtoError::FrameTooLarge(payload.len() as u32, 26));
    }
    let timestamp_ns = i64::from_be_bytes(payload[0..8].try_into().unwrap());
    let attempts = u16::from_be_bytes(payload[8..10].try_into().unwrap());
    let mut id = [0_u8; 16];
    id.copy_from_slice(&payload[10..26]);
    let body = &payload[26..];
    Ok((timestamp_ns, attempts, id, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_message_payload() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&42_i64.to_be_bytes());
        payload.extend_from_slice(&3_u16.to_be_bytes());
        payload.extend_from_slice(b"0123456789abcdef");
        payload.extend_from_slice(b"hello world");

        let (ts, attempts, id, body) = decode_message_payload(&payload).unwrap();
        assert_eq!(ts, 42);
        assert_eq!(attempts, 3);
        assert_eq!(&id, b"0123456789abcdef");
        assert_eq!(body, b"hello world");
    }

    #[test]
    fn rejects_short_payload() {
        let payload = vec![0_u8; 10];
        assert!(decode_message_payload(&payload).is_err());
    }
}
