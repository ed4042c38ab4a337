//! HTTP/1.1 upgrade handshake for tunnel sessions
//!
//! Tunnel sessions live behind a single fixed path so the endpoint can sit
//! behind a reverse proxy or CDN front-end. Requests for any other path get
//! a small landing page, which is also what a probing scanner sees. The
//! front-end's `x-forwarded-for` header, when present, carries the real
//! client address.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TunnelError;

/// The one path that upgrades into a tunnel session.
pub const TUNNEL_PATH: &str = "/_t";

/// Upgrade protocol token
const PROTOCOL: &str = "detour";

/// Upper bound on a request/response head
const MAX_HEAD: usize = 8 * 1024;

const LANDING_BODY: &str = "detour endpoint\n";

/// What an accepted connection turned out to be.
#[derive(Debug)]
pub struct Session {
    /// Client address reported by a reverse proxy, if any.
    pub forwarded_for: Option<IpAddr>,
}

/// Read an HTTP head up to and including the blank line.
///
/// Reads one byte at a time so no bytes of the framed stream that follows
/// the head are ever consumed. Heads are tiny and read once per session.
async fn read_head<S>(io: &mut S) -> Result<String, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD {
            return Err(TunnelError::BadUpgrade);
        }
        let n = io.read(&mut byte).await?;
        if n == 0 {
            return Err(TunnelError::BadUpgrade);
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| TunnelError::BadUpgrade)
}

/// Client side: request the upgrade and require a `101` back.
pub async fn connect<S>(io: &mut S, host: &str) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {TUNNEL_PATH} HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: {PROTOCOL}\r\n\r\n"
    );
    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let head = read_head(io).await?;
    let status_line = head.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "101" {
        return Err(TunnelError::UpgradeRejected(status_line.to_string()));
    }
    Ok(())
}

/// Server side: parse the request head and answer it.
///
/// Returns `Some(Session)` once the `101` has been written for a tunnel
/// request; returns `None` after serving the landing page to anything else.
pub async fn accept<S>(io: &mut S) -> Result<Option<Session>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_head(io).await?;
    let mut lines = head.lines();
    let request_line = lines.next().ok_or(TunnelError::BadUpgrade)?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(TunnelError::BadUpgrade)?;
    let path = parts.next().ok_or(TunnelError::BadUpgrade)?;

    if method != "GET" || path != TUNNEL_PATH {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            LANDING_BODY.len(),
            LANDING_BODY
        );
        io.write_all(response.as_bytes()).await?;
        io.flush().await?;
        return Ok(None);
    }

    let forwarded_for = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("x-forwarded-for"))
        .and_then(|(_, value)| value.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());

    io.write_all(
        format!("HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: {PROTOCOL}\r\n\r\n")
            .as_bytes(),
    )
    .await?;
    io.flush().await?;

    Ok(Some(Session { forwarded_for }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upgrade_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let session = accept(&mut server).await.unwrap();
            session.expect("tunnel request expected")
        });

        connect(&mut client, "relay.example.com").await.unwrap();
        let session = server_task.await.unwrap();
        assert!(session.forwarded_for.is_none());
    }

    #[tokio::test]
    async fn test_forwarded_for_captured() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let request = format!(
                "GET {TUNNEL_PATH} HTTP/1.1\r\nHost: h\r\nX-Forwarded-For: 203.0.113.9, 10.0.0.1\r\n\r\n"
            );
            client.write_all(request.as_bytes()).await.unwrap();
            // leave the connection open so the 101 can be written
            let mut buf = [0u8; 256];
            let _ = client.read(&mut buf).await;
        });

        let session = accept(&mut server).await.unwrap().unwrap();
        assert_eq!(session.forwarded_for, Some("203.0.113.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_other_paths_get_landing_page() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move { accept(&mut server).await.unwrap() });

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        assert!(server_task.await.unwrap().is_none());
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with(LANDING_BODY));
    }

    #[tokio::test]
    async fn test_rejected_upgrade_reported() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let _ = read_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 404 Not Found\r\n\r\n")
                .await
                .unwrap();
        });

        match connect(&mut client, "h").await {
            Err(TunnelError::UpgradeRejected(line)) => assert!(line.contains("404")),
            other => panic!("expected UpgradeRejected, got {:?}", other),
        }
    }
}
