use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced synchronously from the [`Consumer`](crate::consumer::Consumer)
/// public API. Transport-level failures never reach here directly — a failing
/// connection closes itself and relies on discovery to reconnect; only usage
/// errors and handshake failures are returned to the caller.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),
    #[error("consumer is stopped")]
    Stopped,
    #[error("add_handler must be called before connecting")]
    NoHandlers,
    #[error("refused to disconnect the last lookup endpoint while lookup polling is active")]
    LastLookupEndpoint,
    #[error("not connected to lookup endpoint {0}")]
    LookupEndpointNotFound(String),
    #[error("handshake with {addr} failed: {reason}")]
    Identify { addr: SocketAddr, reason: String },
    #[error("protocol error from {addr}: {reason}")]
    Protocol { addr: SocketAddr, reason: String },
    #[error("io error with {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("lookup request to {endpoint} failed: {reason}")]
    Lookup { endpoint: String, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
