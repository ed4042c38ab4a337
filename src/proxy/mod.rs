//! Local SOCKS5 proxy
//!
//! Accepts SOCKS5 clients, resolves each target against the rule table and
//! dispatches the connection directly, through the encrypted tunnel, or not
//! at all.

mod server;

pub use server::{ProxyHandle, ProxyServer};

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address error: {0}")]
    Addr(#[from] crate::socks::AddrError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] crate::tunnel::TunnelError),
}
