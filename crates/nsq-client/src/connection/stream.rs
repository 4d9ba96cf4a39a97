use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use async_compression::tokio::bufread::DeflateDecoder;
use async_compression::tokio::write::DeflateEncoder;
use native_tls::{Protocol, TlsConnector as NativeTlsConnector};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_native_tls::{TlsConnector, TlsStream};

use crate::config::{Compression, TlsConfig, TlsMinVersion};
use crate::error::ConsumerError;

/// A duplex byte stream, type-erased after any TLS/compression layering.
pub(crate) trait AsyncDuplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncDuplex for T {}

pub(crate) type BoxedStream = Box<dyn AsyncDuplex>;

pub(crate) async fn connect_tcp(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<BoxedStream, ConsumerError> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ConsumerError::Io {
            addr,
            source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|source| ConsumerError::Io { addr, source })?;
    stream.set_nodelay(true).ok();
    Ok(Box::new(stream))
}

/// Upgrades `stream` to TLS per `tls`, re-verifying the peer unless
/// `insecure_skip_verify` is set. Always enforces a TLS 1.2 floor.
pub(crate) async fn upgrade_tls(
    stream: BoxedStream,
    addr: SocketAddr,
    tls: &TlsConfig,
) -> Result<BoxedStream, ConsumerError> {
    let min_version = match tls.min_version {
        // native-tls has no TLS 1.3 variant of its own; Tlsv12 is the
        // strictest floor it exposes, and backends negotiate 1.3 above it
        // when both peers support it.
        TlsMinVersion::Tls12 | TlsMinVersion::Tls13 => Protocol::Tlsv12,
    };

    let mut builder = NativeTlsConnector::builder();
    builder.min_protocol_version(Some(min_version));
    if tls.insecure_skip_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }

    let native_connector = builder.build().map_err(|err| ConsumerError::Identify {
        addr,
        reason: format!("failed to build tls connector: {err}"),
    })?;
    let connector = TlsConnector::from(native_connector);

    let tls_stream: TlsStream<BoxedStream> =
        connector.connect(&addr.ip().to_string(), stream).await.map_err(|err| {
            ConsumerError::Identify { addr, reason: format!("tls handshake failed: {err}") }
        })?;

    Ok(Box::new(tls_stream))
}

/// Wraps `stream` with the negotiated compression, if any.
pub(crate) fn wrap_compression(
    stream: BoxedStream,
    compression: Compression,
) -> BoxedStream {
    match compression {
        Compression::None => stream,
        Compression::Deflate { level } => {
            let (read_half, write_half) = tokio::io::split(stream);
            let level = async_compression::Level::Precise(level.clamp(0, 9));
            let read = DeflateDecoder::new(BufReader::new(read_half));
            let write = DeflateEncoder::with_quality(write_half, level);
            Box::new(Duplex { read, write })
        }
        Compression::Snappy => {
            let (read_half, write_half) = tokio::io::split(stream);
            let read = SnappyReader::new(read_half);
            let write = SnappyWriter::new(write_half);
            Box::new(Duplex { read, write })
        }
    }
}

/// Glues an independently-wrapped read half and write half back into a
/// single duplex stream.
struct Duplex<R, W> {
    read: R,
    write: W,
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for Duplex<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.read).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for Duplex<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.write).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.write).poll_shutdown(cx)
    }
}

const SNAPPY_LEN_PREFIX: usize = 4;

/// Reads one length-prefixed snappy block per logical frame. This is a
/// block framing of our own (length-prefix + raw snappy block), not the
/// upstream "snappy framing format" — the peer this connects to negotiates
/// and speaks the same framing since both sides are this crate's handshake.
struct SnappyReader<R> {
    inner: R,
    len_buf: [u8; SNAPPY_LEN_PREFIX],
    len_filled: usize,
    block: Vec<u8>,
    block_filled: usize,
    block_len: Option<usize>,
    decoded: Vec<u8>,
    decoded_pos: usize,
}

impl<R> SnappyReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            len_buf: [0; SNAPPY_LEN_PREFIX],
            len_filled: 0,
            block: Vec::new(),
            block_filled: 0,
            block_len: None,
            decoded: Vec::new(),
            decoded_pos: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SnappyReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if this.decoded_pos < this.decoded.len() {
                let remaining = &this.decoded[this.decoded_pos..];
                let n = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..n]);
                this.decoded_pos += n;
                return Poll::Ready(Ok(()));
            }

            if this.block_len.is_none() {
                while this.len_filled < SNAPPY_LEN_PREFIX {
                    let mut read_buf = ReadBuf::new(&mut this.len_buf[this.len_filled..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    this.len_filled += n;
                }
                let len = u32::from_le_bytes(this.len_buf) as usize;
                this.block = vec![0_u8; len];
                this.block_filled = 0;
                this.block_len = Some(len);
            }

            let block_len = this.block_len.unwrap();
            while this.block_filled < block_len {
                let mut read_buf = ReadBuf::new(&mut this.block[this.block_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
                let n = read_buf.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "snappy block truncated",
                    )));
                }
                this.block_filled += n;
            }

            let mut decoder = snap::raw::Decoder::new();
            this.decoded = decoder
                .decompress_vec(&this.block)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            this.decoded_pos = 0;
            this.len_filled = 0;
            this.block_len = None;
        }
    }
}

struct SnappyWriter<W> {
    inner: W,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<W> SnappyWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, pending: Vec::new(), pending_pos: 0 }
    }
}

impl<W: AsyncWrite + Unpin> SnappyWriter<W> {
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write snappy block",
                )));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SnappyWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;

        let mut encoder = snap::raw::Encoder::new();
        let compressed = encoder
            .compress_vec(buf)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        this.pending.reserve(SNAPPY_LEN_PREFIX + compressed.len());
        this.pending.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        this.pending.extend_from_slice(&compressed);
        this.pending_pos = 0;

        ready!(this.poll_drain_pending(cx))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[allow(dead_code)]
type HalfPair = (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>);

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn snappy_round_trips_a_frame() {
        let (client, server) = duplex(4096);
        let mut writer = SnappyWriter::new(client);
        let mut reader = SnappyReader::new(server);

        writer.write_all(b"hello snappy world").await.unwrap();
        writer.flush().await.unwrap();

        let mut out = vec![0_u8; 18];
        reader.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello snappy world");
    }
}
