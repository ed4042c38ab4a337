//! Tunnel layer - encrypted channel and remote endpoint
//!
//! Provides:
//! - `SecureStream`: AEAD + zlib framing over any duplex stream
//! - HTTP/1.1 upgrade handshake pinning sessions to a fixed path
//! - `TunnelServer`: the remote side that dials the real target

mod endpoint;
mod secure;
pub mod upgrade;

pub use endpoint::TunnelServer;
pub use secure::SecureStream;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("upgrade rejected by remote: {0}")]
    UpgradeRejected(String),

    #[error("malformed upgrade request")]
    BadUpgrade,

    #[error("TLS error: {0}")]
    Tls(String),
}

/// Any duplex byte stream the tunnel can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}
