//! # Detour
//!
//! A SOCKS5 proxy that routes each client connection directly, drops it, or
//! detours it through an encrypted tunnel to a remote relay endpoint, chosen
//! per-connection from a mutable domain-suffix rule set.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Local SOCKS5 proxy                  │
//! │      (handshake, rule resolution, mode dispatch)     │
//! ├──────────────────────────────────────────────────────┤
//! │                     Rule table                       │
//! │     (longest-suffix match, live add/delete/persist)  │
//! ├──────────────────────────────────────────────────────┤
//! │                   Secure channel                     │
//! │      (AES-GCM sealing, zlib frames, seq nonces)      │
//! ├──────────────────────────────────────────────────────┤
//! │                   Remote endpoint                    │
//! │        (upgrade, target decode, outbound dial)       │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod control;
pub mod crypto;
pub mod proxy;
pub mod relay;
pub mod rules;
pub mod socks;
pub mod tunnel;

pub use config::Settings;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Address error: {0}")]
    Addr(#[from] socks::AddrError),

    #[error("Rule error: {0}")]
    Rule(#[from] rules::RuleError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
