//! Encrypted, compressed stream wrapper
//!
//! Wire format: each frame is a `u16` big-endian length prefix followed by
//! the zlib-compressed sealed record (`seq ‖ ciphertext ‖ tag`). One frame
//! is produced per write call and consumed whole per wire read; surplus
//! plaintext is buffered and served to small reads before the wire is
//! touched again.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::crypto::Security;

/// Frame length prefix size
const LEN_PREFIX: usize = 2;

/// Largest plaintext sealed into a single frame. Keeps the compressed frame
/// comfortably under the u16 length limit even for incompressible input.
const MAX_CHUNK: usize = 16 * 1024;

/// Pending-output size beyond which writes exert backpressure
const WRITE_BACKPRESSURE: usize = 128 * 1024;

/// A duplex stream sealed with a shared [`Security`] context.
///
/// Read/Write semantics match the wrapped stream; bytes on the wire are
/// encrypted and compressed. Decompression or decryption failure is a hard
/// channel error. A peer close on a frame boundary is clean end-of-stream;
/// a close mid-frame is normalized to end-of-stream once buffered plaintext
/// has drained.
pub struct SecureStream<S> {
    io: S,
    security: Arc<Security>,
    peer: SocketAddr,
    /// decrypted bytes not yet handed to the caller
    rd_plain: BytesMut,
    /// wire bytes of the frame currently being accumulated
    rd_frame: BytesMut,
    rd_closed: bool,
    /// encoded frames not yet flushed to the wire
    wr_pending: BytesMut,
}

impl<S> SecureStream<S> {
    /// Wrap an established stream. `peer` is the address reported by
    /// [`SecureStream::peer_addr`]; sessions arriving through a reverse
    /// proxy pass the forwarded client address here instead of the
    /// socket-level one.
    pub fn new(io: S, security: Arc<Security>, peer: SocketAddr) -> Self {
        Self {
            io,
            security,
            peer,
            rd_plain: BytesMut::new(),
            rd_frame: BytesMut::new(),
            rd_closed: false,
            wr_pending: BytesMut::new(),
        }
    }

    /// The remote address of this channel.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

fn compress(record: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(record.len() / 2 + 16), Compression::default());
    encoder.write_all(record)?;
    encoder.finish()
}

fn decompress(frame: &[u8]) -> io::Result<Vec<u8>> {
    let mut record = Vec::with_capacity(frame.len() * 2);
    ZlibDecoder::new(frame).read_to_end(&mut record)?;
    Ok(record)
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureStream<S> {
    /// Wire bytes still missing from the current frame, 0 if complete.
    fn frame_bytes_needed(&self) -> usize {
        if self.rd_frame.len() < LEN_PREFIX {
            return LEN_PREFIX - self.rd_frame.len();
        }
        let frame_len = u16::from_be_bytes([self.rd_frame[0], self.rd_frame[1]]) as usize;
        LEN_PREFIX + frame_len - self.rd_frame.len()
    }

    /// Decompress and open the completed frame into `rd_plain`.
    fn decode_frame(&mut self) -> io::Result<()> {
        let record = decompress(&self.rd_frame[LEN_PREFIX..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let plaintext = self
            .security
            .open(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        self.rd_plain.extend_from_slice(&plaintext);
        self.rd_frame.clear();
        Ok(())
    }

    /// Seal one plaintext chunk and queue the encoded frame.
    fn encode_frame(&mut self, chunk: &[u8]) -> io::Result<()> {
        let record = self
            .security
            .seal(chunk)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let frame = compress(&record)?;

        debug_assert!(frame.len() <= u16::MAX as usize);
        self.wr_pending.put_u16(frame.len() as u16);
        self.wr_pending.extend_from_slice(&frame);
        Ok(())
    }

    /// Push queued frame bytes into the underlying stream.
    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.wr_pending.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.wr_pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wr_pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.rd_plain.is_empty() {
                let n = this.rd_plain.len().min(buf.remaining());
                buf.put_slice(&this.rd_plain.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.rd_closed {
                return Poll::Ready(Ok(()));
            }

            let need = this.frame_bytes_needed();
            if need == 0 {
                this.decode_frame()?;
                continue;
            }

            this.rd_frame.reserve(need);
            let spare = &mut this.rd_frame.spare_capacity_mut()[..need];
            let mut wire = ReadBuf::uninit(spare);
            ready!(Pin::new(&mut this.io).poll_read(cx, &mut wire))?;

            let n = wire.filled().len();
            if n == 0 {
                // peer closed; a frame cut off mid-way is treated as
                // end-of-stream, not an error
                this.rd_closed = true;
                this.rd_frame.clear();
                return Poll::Ready(Ok(()));
            }
            // the bytes were filled into rd_frame's spare capacity above
            unsafe { this.rd_frame.advance_mut(n) };
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecureStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // push queued frames along first so wire errors surface before new
        // data is accepted; only a large backlog blocks the caller
        match this.poll_write_pending(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending if this.wr_pending.len() >= WRITE_BACKPRESSURE => return Poll::Pending,
            _ => {}
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk_len = buf.len().min(MAX_CHUNK);
        this.encode_frame(&buf[..chunk_len])?;
        Poll::Ready(Ok(chunk_len))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_pending(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn pair() -> (SecureStream<tokio::io::DuplexStream>, SecureStream<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let sec_a = Arc::new(Security::new("passkey").unwrap());
        let sec_b = Arc::new(Security::new("passkey").unwrap());
        (
            SecureStream::new(a, sec_a, peer()),
            SecureStream::new(b, sec_b, peer()),
        )
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (mut a, mut b) = pair();

        a.write_all(b"hello across the tunnel").await.unwrap();
        a.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello across the tunnel");
    }

    #[tokio::test]
    async fn test_small_reads_drain_buffered_plaintext() {
        let (mut a, mut b) = pair();

        a.write_all(b"0123456789").await.unwrap();
        a.flush().await.unwrap();

        // one frame arrives, served in pieces
        let mut piece = [0u8; 3];
        b.read_exact(&mut piece).await.unwrap();
        assert_eq!(&piece, b"012");
        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"3456789");
    }

    #[tokio::test]
    async fn test_large_payload_spans_frames() {
        let (mut a, mut b) = pair();

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            a.write_all(&payload).await.unwrap();
            a.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_writes_each_decrypt() {
        let (mut a, mut b) = pair();

        for i in 0..20u8 {
            a.write_all(&[i; 100]).await.unwrap();
            a.flush().await.unwrap();
            let mut buf = [0u8; 100];
            b.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [i; 100]);
        }
    }

    #[tokio::test]
    async fn test_clean_eof_on_frame_boundary() {
        let (mut a, mut b) = pair();
        a.write_all(b"last words").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn test_tampered_frame_is_channel_error() {
        let (raw_a, mut raw_b) = tokio::io::duplex(1 << 16);
        let sec = Arc::new(Security::new("passkey").unwrap());
        let mut a = SecureStream::new(raw_a, sec.clone(), peer());

        a.write_all(b"sensitive").await.unwrap();
        a.flush().await.unwrap();

        // intercept the wire frame and flip one ciphertext byte
        let mut wire = [0u8; 1024];
        let n = raw_b.read(&mut wire).await.unwrap();
        let last = n - 1;
        wire[last] ^= 0x01;

        let (raw_c, mut raw_d) = tokio::io::duplex(1 << 16);
        raw_d.write_all(&wire[..n]).await.unwrap();
        let mut victim = SecureStream::new(raw_c, sec, peer());

        let mut buf = [0u8; 64];
        let err = victim.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_channel_error() {
        let (raw_a, mut raw_b) = tokio::io::duplex(1 << 16);
        let sec = Arc::new(Security::new("passkey").unwrap());
        let mut victim = SecureStream::new(raw_a, sec, peer());

        // well-formed length prefix, but the body is not zlib data
        raw_b.write_all(&[0, 4, 0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

        let mut buf = [0u8; 16];
        let err = victim.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_mid_frame_close_normalized_to_eof() {
        let (raw_a, mut raw_b) = tokio::io::duplex(1 << 16);
        let sec = Arc::new(Security::new("passkey").unwrap());
        let mut victim = SecureStream::new(raw_a, sec, peer());

        // length prefix promises more than ever arrives
        raw_b.write_all(&[0, 50, 1, 2, 3]).await.unwrap();
        raw_b.shutdown().await.unwrap();
        drop(raw_b);

        let mut buf = [0u8; 16];
        assert_eq!(victim.read(&mut buf).await.unwrap(), 0);
    }
}
