//! SOCKS5 wire format (RFC 1928): address records and protocol constants
//!
//! The address record layout is shared between the client-facing SOCKS5
//! handshake and the tunnel protocol, which sends one record as the first
//! frame of every session.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// SOCKS5 version byte
pub const SOCKS_VERSION: u8 = 0x05;

/// Address-type tags
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Request commands
pub const CMD_CONNECT: u8 = 0x01;

/// Reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Address record errors
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported address type: {0}")]
    UnsupportedType(u8),
}

/// One SOCKS5 address record: type tag, host payload, big-endian port.
///
/// The raw wire bytes are kept as read so the record can be retransmitted
/// verbatim without re-encoding; `host()` and `Display` decode on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Addr {
    wire: Vec<u8>,
}

impl Addr {
    /// Read exactly one address record from a stream.
    ///
    /// Reads no more than the record needs. A short read propagates as an
    /// I/O error and an unknown type tag is a parse error; no partial
    /// record is ever returned.
    pub async fn read<R>(r: &mut R) -> Result<Self, AddrError>
    where
        R: AsyncRead + Unpin,
    {
        let mut tag = [0u8; 1];
        r.read_exact(&mut tag).await?;

        let mut wire = vec![tag[0]];
        let payload_len = match tag[0] {
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                r.read_exact(&mut len).await?;
                wire.push(len[0]);
                len[0] as usize
            }
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            other => return Err(AddrError::UnsupportedType(other)),
        };

        // host payload plus the two port bytes
        let start = wire.len();
        wire.resize(start + payload_len + 2, 0);
        r.read_exact(&mut wire[start..]).await?;

        Ok(Self { wire })
    }

    /// The exact bytes consumed from the stream.
    pub fn as_bytes(&self) -> &[u8] {
        &self.wire
    }

    /// Decode the hostname or IP literal.
    pub fn host(&self) -> String {
        match self.wire[0] {
            ATYP_DOMAIN => {
                let len = self.wire[1] as usize;
                String::from_utf8_lossy(&self.wire[2..2 + len]).into_owned()
            }
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&self.wire[1..5]);
                Ipv4Addr::from(ip).to_string()
            }
            _ => {
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&self.wire[1..17]);
                Ipv6Addr::from(ip).to_string()
            }
        }
    }

    /// Decode the port.
    pub fn port(&self) -> u16 {
        let n = self.wire.len();
        u16::from_be_bytes([self.wire[n - 2], self.wire[n - 1]])
    }
}

impl fmt::Display for Addr {
    /// `host:port`, with IPv6 literals bracketed for dialing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wire[0] == ATYP_IPV6 {
            write!(f, "[{}]:{}", self.host(), self.port())
        } else {
            write!(f, "{}:{}", self.host(), self.port())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(bytes: &[u8]) -> Result<Addr, AddrError> {
        let mut cursor = bytes;
        Addr::read(&mut cursor).await
    }

    #[tokio::test]
    async fn test_domain_round_trip() {
        let mut wire = vec![ATYP_DOMAIN, 11];
        wire.extend_from_slice(b"example.com");
        wire.extend_from_slice(&443u16.to_be_bytes());

        let addr = parse(&wire).await.unwrap();
        assert_eq!(addr.as_bytes(), &wire[..]);
        assert_eq!(addr.host(), "example.com");
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_ipv4_round_trip() {
        let wire = [ATYP_IPV4, 10, 0, 0, 1, 0x1F, 0x90];

        let addr = parse(&wire).await.unwrap();
        assert_eq!(addr.as_bytes(), &wire[..]);
        assert_eq!(addr.to_string(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_ipv6_round_trip() {
        let mut wire = vec![ATYP_IPV6];
        wire.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        wire.extend_from_slice(&80u16.to_be_bytes());

        let addr = parse(&wire).await.unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.to_string(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_unknown_tag_rejected() {
        let wire = [0x02, 0, 0, 0, 0, 0, 0];
        match parse(&wire).await {
            Err(AddrError::UnsupportedType(0x02)) => {}
            other => panic!("expected UnsupportedType, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_read_is_io_error() {
        // domain record truncated before the port bytes
        let wire = [ATYP_DOMAIN, 5, b'a', b'b'];
        match parse(&wire).await {
            Err(AddrError::Io(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("expected Io error, got {:?}", other),
        }
    }
}
