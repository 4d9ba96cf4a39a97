use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// The client-capabilities document sent as the `IDENTIFY` body.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyRequest {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval: i64,
    pub output_buffer_size: i64,
    pub output_buffer_timeout: i64,
    pub msg_timeout: i64,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: i32,
    pub snappy: bool,
    pub sample_rate: i32,
    pub feature_negotiation: bool,
}

impl Default for IdentifyRequest {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            hostname: String::new(),
            user_agent: concat!("nsq-client/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: 30_000,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: 250,
            msg_timeout: 0,
            tls_v1: false,
            deflate: false,
            deflate_level: 6,
            snappy: false,
            sample_rate: 0,
            feature_negotiation: true,
        }
    }
}

pub fn encode_identify_request(
    request: &IdentifyRequest
) -> Result<Vec<u8>, ProtoError> {
    serde_json::to_vec(request)
        .map_err(|err| ProtoError::IdentifyEncode(err.to_string()))
}

/// The server's feature-negotiation response to `IDENTIFY`.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentifyResponse {
    #[serde(default)]
    pub max_rdy_count: i64,
    #[serde(default)]
    pub heartbeat_interval: i64,
    #[serde(default)]
    pub output_buffer_size: i64,
    #[serde(default)]
    pub output_buffer_timeout: i64,
    #[serde(default)]
    pub msg_timeout: i64,
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub deflate_level: i32,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub sample_rate: i32,
    #[serde(default)]
    pub auth_required: bool,
}

impl Default for IdentifyResponse {
    fn default() -> Self {
        Self {
            max_rdy_count: 2500,
            heartbeat_interval: 30_000,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: 250,
            msg_timeout: 60_000,
            tls_v1: false,
            deflate: false,
            deflate_level: 6,
            snappy: false,
            sample_rate: 0,
            auth_required: false,
        }
    }
}

pub fn decode_identify_response(
    bytes: &[u8]
) -> Result<IdentifyResponse, ProtoError> {
    if bytes == b"OK" {
        return Ok(IdentifyResponse::default());
    }
    serde_json::from_slice(bytes)
        .map_err(|err| ProtoError::IdentifyDecode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_identify_response() {
        let json = br#"{"max_rdy_count":2500,"heartbeat_interval":30000,"tls_v1":true}"#;
        let resp = decode_identify_response(json).unwrap();
        assert_eq!(resp.max_rdy_count, 2500);
        assert_eq!(resp.heartbeat_interval, 30_000);
        assert!(resp.tls_v1);
        assert!(!resp.snappy);
    }

    #[test]
    fn bare_ok_response_uses_defaults() {
        let resp = decode_identify_response(b"OK").unwrap();
        assert_eq!(resp.heartbeat_interval, 30_000);
    }

    #[test]
    fn encode_then_decode_preserves_fields_a_server_would_echo() {
        let mut req = IdentifyRequest::default();
        req.client_id = "worker-1".to_string();
        req.heartbeat_interval = 15_000;
        let encoded = encode_identify_request(&req).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(value["client_id"], "worker-1");
        assert_eq!(value["heartbeat_interval"], 15_000);
    }
}
