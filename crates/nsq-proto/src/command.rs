use std::sync::LazyLock;

use regex::Regex;

use crate::error::ProtoError;

static VALID_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[.a-zA-Z0-9_\-]+(#ephemeral)?$").expect("valid regex")
});

fn validate_name(name: &str) -> Result<(), ProtoError> {
    if name.is_empty() || name.len() > 64 || !VALID_NAME.is_match(name) {
        return Err(ProtoError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Builds a length-prefixed, body-bearing command line: `VERB\nsize(u32be)body`.
fn with_body(verb: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(verb.len() + 1 + 4 + body.len());
    out.extend_from_slice(verb.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// `IDENTIFY` — sends client capabilities as a JSON body.
pub fn identify(json_body: &[u8]) -> Vec<u8> {
    with_body("IDENTIFY", json_body)
}

/// `SUB topic channel\n` after validating both names.
pub fn sub(topic: &str, channel: &str) -> Result<Vec<u8>, ProtoError> {
    validate_name(topic)?;
    validate_name(channel)?;
    Ok(format!("SUB {topic} {channel}\n").into_bytes())
}

/// `RDY n\n`.
pub fn rdy(n: u32) -> Vec<u8> {
    format!("RDY {n}\n").into_bytes()
}

/// `FIN id\n`. `id` is rendered as a fixed 16-byte ASCII token, as nsqd sends it.
pub fn fin(message_id: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 16 + 1);
    out.extend_from_slice(b"FIN ");
    out.extend_from_slice(message_id);
    out.push(b'\n');
    out
}

/// `REQ id delay_ms\n`.
pub fn req(message_id: &[u8; 16], delay: std::time::Duration) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 16 + 16);
    out.extend_from_slice(b"REQ ");
    out.extend_from_slice(message_id);
    out.extend_from_slice(format!(" {}\n", delay.as_millis()).as_bytes());
    out
}

/// `TOUCH id\n`.
pub fn touch(message_id: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + 16 + 1);
    out.extend_from_slice(b"TOUCH ");
    out.extend_from_slice(message_id);
    out.push(b'\n');
    out
}

/// `NOP\n`.
pub fn nop() -> Vec<u8> {
    b"NOP\n".to_vec()
}

/// `CLS\n`.
pub fn cls() -> Vec<u8> {
    b"CLS\n".to_vec()
}

/// `AUTH` — sends a shared secret as the body.
pub fn auth(secret: &str) -> Vec<u8> {
    with_body("AUTH", secret.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_accepts_plain_names() {
        let encoded = sub("events", "worker-1").unwrap();
        assert_eq!(encoded, b"SUB events worker-1\n");
    }

    #[test]
    fn sub_accepts_ephemeral_channel() {
        let encoded = sub("events", "tmp#ephemeral").unwrap();
        assert_eq!(encoded, b"SUB events tmp#ephemeral\n");
    }

    #[test]
    fn sub_rejects_invalid_characters() {
        assert!(sub("events!", "chan").is_err());
        assert!(sub("events", "").is_err());
    }

    #[test]
    fn sub_rejects_overlong_name() {
        let too_long = "a".repeat(65);
        assert!(sub(&too_long, "chan").is_err());
    }

    #[test]
    fn rdy_formats_count() {
        assert_eq!(rdy(0), b"RDY 0\n");
        assert_eq!(rdy(250), b"RDY 250\n");
    }

    #[test]
    fn fin_embeds_raw_id_bytes() {
        let id = *b"0123456789abcdef";
        let encoded = fin(&id);
        assert_eq!(&encoded[..4], b"FIN ");
        assert_eq!(&encoded[4..20], &id);
        assert_eq!(encoded[20], b'\n');
    }

    #[test]
    fn req_includes_delay_millis() {
        let id = *b"0123456789abcdef";
        let encoded = req(&id, std::time::Duration::from_secs(1));
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.ends_with(" 1000\n"));
    }

    #[test]
    fn identify_prefixes_body_with_length() {
        let body = br#"{"client_id":"x"}"#;
        let encoded = identify(body);
        assert!(encoded.starts_with(b"IDENTIFY\n"));
        let len_bytes = &encoded[9..13];
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap());
        assert_eq!(len as usize, body.len());
    }
}
