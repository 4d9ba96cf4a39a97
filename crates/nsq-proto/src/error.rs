use thiserror::Error;

/// Wire-level errors: framing, command encoding, IDENTIFY JSON round-trip.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u32),
    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(u32, u32),
    #[error("invalid topic or channel name: {0:?}")]
    InvalidName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identify encode error: {0}")]
    IdentifyEncode(String),
    #[error("identify decode error: {0}")]
    IdentifyDecode(String),
}
