use std::net::SocketAddr;

use nsq_proto::{FrameType, IdentifyRequest, IdentifyResponse};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

use super::stream::{self, BoxedStream};
use crate::config::{Compression, Config};
use crate::error::ConsumerError;

/// Performs the full connection handshake against a single nsqd: connect,
/// magic, `IDENTIFY` (with its TLS/compression upgrade), optional `AUTH`,
/// then `SUB`. On success the returned stream is ready for the steady-state
/// read/write loops and `topic`/`channel` are already subscribed.
pub(crate) async fn handshake(
    addr: SocketAddr,
    topic: &str,
    channel: &str,
    config: &Config,
) -> Result<(BoxedStream, IdentifyResponse), ConsumerError> {
    let mut conn = stream::connect_tcp(addr, config.connect_timeout).await?;

    write_timeout(&mut conn, &nsq_proto::MAGIC, addr, config).await?;

    let identify_req = build_identify_request(config);
    let identify_body = nsq_proto::identify::encode_identify_request(&identify_req)
        .map_err(|err| ConsumerError::Identify { addr, reason: err.to_string() })?;
    let identify_cmd = nsq_proto::command::identify(&identify_body);
    write_timeout(&mut conn, &identify_cmd, addr, config).await?;

    let (frame_type, payload) = read_frame(&mut conn, addr, config).await?;
    expect_ok_frame(frame_type, &payload, addr, "IDENTIFY")?;
    let identify_resp = nsq_proto::identify::decode_identify_response(&payload)
        .map_err(|err| ConsumerError::Identify { addr, reason: err.to_string() })?;

    if identify_resp.tls_v1 {
        if !config.tls.enabled {
            return Err(ConsumerError::Identify {
                addr,
                reason: "nsqd requires tls_v1 but it is disabled locally".to_string(),
            });
        }
        conn = stream::upgrade_tls(conn, addr, &config.tls).await?;
        let (frame_type, payload) = read_frame(&mut conn, addr, config).await?;
        expect_ok_frame(frame_type, &payload, addr, "TLS upgrade")?;
    }

    let compression = if identify_resp.snappy {
        Compression::Snappy
    } else if identify_resp.deflate {
        Compression::Deflate { level: identify_resp.deflate_level }
    } else {
        Compression::None
    };
    let mut conn = stream::wrap_compression(conn, compression);
    if compression != Compression::None {
        let (frame_type, payload) = read_frame(&mut conn, addr, config).await?;
        expect_ok_frame(frame_type, &payload, addr, "compression upgrade")?;
    }

    if identify_resp.auth_required {
        let secret = config.auth_secret.as_deref().ok_or_else(|| ConsumerError::Identify {
            addr,
            reason: "nsqd requires AUTH but no auth_secret is configured".to_string(),
        })?;
        let auth_cmd = nsq_proto::command::auth(secret);
        write_timeout(&mut conn, &auth_cmd, addr, config).await?;
        let (frame_type, payload) = read_frame(&mut conn, addr, config).await?;
        if frame_type == FrameType::Error {
            return Err(ConsumerError::Identify {
                addr,
                reason: format!("AUTH rejected: {}", String::from_utf8_lossy(&payload)),
            });
        }
    }

    let sub_cmd = nsq_proto::command::sub(topic, channel)
        .map_err(|err| ConsumerError::Identify { addr, reason: err.to_string() })?;
    write_timeout(&mut conn, &sub_cmd, addr, config).await?;
    let (frame_type, payload) = read_frame(&mut conn, addr, config).await?;
    expect_ok_frame(frame_type, &payload, addr, "SUB")?;

    Ok((conn, identify_resp))
}

fn build_identify_request(config: &Config) -> IdentifyRequest {
    IdentifyRequest {
        client_id: config.client_id.clone(),
        hostname: config.hostname.clone(),
        user_agent: config.user_agent.clone(),
        heartbeat_interval: config.heartbeat_interval.as_millis() as i64,
        output_buffer_size: IdentifyRequest::default().output_buffer_size,
        output_buffer_timeout: IdentifyRequest::default().output_buffer_timeout,
        msg_timeout: config.msg_timeout.as_millis() as i64,
        tls_v1: config.tls.enabled,
        deflate: matches!(config.compression, Compression::Deflate { .. }),
        deflate_level: match config.compression {
            Compression::Deflate { level } => level,
            _ => IdentifyRequest::default().deflate_level,
        },
        snappy: matches!(config.compression, Compression::Snappy),
        sample_rate: config.sample_rate,
        feature_negotiation: true,
    }
}

async fn write_timeout(
    conn: &mut BoxedStream,
    bytes: &[u8],
    addr: SocketAddr,
    config: &Config,
) -> Result<(), ConsumerError> {
    timeout(config.write_timeout, conn.write_all(bytes))
        .await
        .map_err(|_| ConsumerError::Io {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake write timed out"),
        })?
        .map_err(|source| ConsumerError::Io { addr, source })
}

async fn read_frame(
    conn: &mut BoxedStream,
    addr: SocketAddr,
    config: &Config,
) -> Result<(FrameType, Vec<u8>), ConsumerError> {
    timeout(config.read_timeout, nsq_proto::frame::read_frame_async(conn, config.max_frame_size))
        .await
        .map_err(|_| ConsumerError::Io {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake read timed out"),
        })?
        .map_err(|err| ConsumerError::Protocol { addr, reason: err.to_string() })
}

fn expect_ok_frame(
    frame_type: FrameType,
    payload: &[u8],
    addr: SocketAddr,
    step: &str,
) -> Result<(), ConsumerError> {
    if frame_type == FrameType::Error {
        return Err(ConsumerError::Identify {
            addr,
            reason: format!("{step} rejected: {}", String::from_utf8_lossy(payload)),
        });
    }
    Ok(())
}
