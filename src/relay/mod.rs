//! Bidirectional relay with per-direction idle timeouts
//!
//! Shovels bytes between two duplex streams until both directions finish.
//! Going idle is the normal way a relayed connection ends: a direction that
//! sees no traffic for the idle window terminates gracefully, as does a
//! clean EOF. Only real I/O failures count as errors.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Sliding idle window applied independently per direction
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Copy buffer per direction
const COPY_BUF: usize = 16 * 1024;

/// Copy `a → b` and `b → a` concurrently until both directions end.
///
/// Returns `(bytes a→b, bytes b→a, first fatal error)`. Idle expiry and
/// clean EOF are graceful completions, not errors; EOF is propagated to the
/// destination so the peer sees the close promptly.
pub async fn relay<A, B>(a: A, b: B, idle: Duration) -> (u64, u64, Option<io::Error>)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let ((a_to_b, err_ab), (b_to_a, err_ba)) =
        tokio::join!(shovel(a_read, b_write, idle), shovel(b_read, a_write, idle));

    (a_to_b, b_to_a, err_ab.or(err_ba))
}

/// One copy direction. Returns bytes written and, for non-timeout I/O
/// failures only, the error that ended the loop.
async fn shovel<R, W>(mut src: R, mut dst: W, idle: Duration) -> (u64, Option<io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF];
    let mut written = 0u64;
    let mut error = None;

    loop {
        let n = match timeout(idle, src.read(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => break,
            Ok(Err(e)) => {
                error = Some(e);
                break;
            }
        };

        let write = async {
            dst.write_all(&buf[..n]).await?;
            dst.flush().await
        };
        match timeout(idle, write).await {
            Err(_) => break,
            Ok(Ok(())) => written += n as u64,
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => break,
            Ok(Err(e)) => {
                error = Some(e);
                break;
            }
        }
    }

    let _ = dst.shutdown().await;
    (written, error)
}
