//! Remote tunnel endpoint
//!
//! Accepts tunnel sessions, learns the true target from the first decrypted
//! record and dials it directly. There is no authentication step: a session
//! sealed with the wrong passphrase fails to decrypt and is torn down,
//! which is the whole access-control story.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use super::{upgrade, SecureStream, TunnelError};
use crate::crypto::Security;
use crate::relay::{self, IDLE_TIMEOUT};
use crate::socks::Addr;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// The remote side of the tunnel.
pub struct TunnelServer {
    listener: TcpListener,
    security: Arc<Security>,
}

impl TunnelServer {
    /// Bind the endpoint listener. A bind failure is fatal.
    pub async fn bind(port: u16, passkey: &str) -> crate::Result<Self> {
        let security = Arc::new(Security::new(passkey)?);
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        Ok(Self { listener, security })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept sessions until the listener fails, one task per session.
    pub async fn run(self) -> crate::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("endpoint on {addr}");
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let security = Arc::clone(&self.security);
                    tokio::spawn(async move {
                        if let Err(e) = handle_session(stream, peer, security).await {
                            warn!("session from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
    }
}

fn keepalive(stream: &TcpStream) {
    let ka = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    let _ = SockRef::from(stream).set_tcp_keepalive(&ka);
}

/// One tunnel session: upgrade, decode the target, dial it, relay.
/// Any failure before the relay closes the session without retry.
async fn handle_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    security: Arc<Security>,
) -> Result<(), TunnelError> {
    let session = match upgrade::accept(&mut stream).await? {
        Some(session) => session,
        // landing page served; not a tunnel session
        None => return Ok(()),
    };

    // behind a front-end the socket peer is the proxy, not the client
    let peer = session
        .forwarded_for
        .map(|ip| SocketAddr::new(ip, 0))
        .unwrap_or(peer);

    let mut secure = SecureStream::new(stream, security, peer);

    let addr = Addr::read(&mut secure)
        .await
        .map_err(|e| TunnelError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

    let target = TcpStream::connect(addr.to_string()).await?;
    keepalive(&target);

    let client = secure.peer_addr();
    let (to_client, to_target, err) = relay::relay(target, secure, IDLE_TIMEOUT).await;
    if let Some(e) = err {
        warn!("relay {addr} failed: {e}");
        return Ok(());
    }
    info!("{client} ~ {addr} <{to_client} {to_target}>");
    Ok(())
}
