//! SOCKS5 proxy server (RFC 1928)

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use super::ProxyError;
use crate::config::{RemoteEndpoint, Settings};
use crate::crypto::Security;
use crate::relay::{self, IDLE_TIMEOUT};
use crate::rules::{Mode, RuleTable};
use crate::socks::{
    Addr, ATYP_IPV4, CMD_CONNECT, REP_CMD_NOT_SUPPORTED, REP_NOT_ALLOWED, REP_SUCCEEDED,
    SOCKS_VERSION,
};
use crate::tunnel::{upgrade, SecureStream, Stream, TunnelError};

/// Bound on a direct dial when the table had no matching rule; a dial that
/// exceeds it falls back to the tunnel path.
const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP keep-alive probe interval for accepted and dialed sockets
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Shared state for every connection task.
struct Inner {
    rules: Arc<RuleTable>,
    security: Arc<Security>,
    remote: RemoteEndpoint,
    tls: Option<tokio_rustls::TlsConnector>,
}

/// The local SOCKS5 server.
pub struct ProxyServer {
    listener: TcpListener,
    inner: Arc<Inner>,
}

/// Handle to a running proxy. The accept loop runs until [`ProxyHandle::stop`]
/// is called (or the handle is dropped, which stops it without waiting).
pub struct ProxyHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Signal the accept loop and wait for it to exit. Connections already
    /// relaying are left to drain on their own idle timeouts.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.task.await;
    }
}

impl ProxyServer {
    /// Bind the local listener. A bind failure is fatal; nothing is retried.
    pub async fn bind(settings: &Settings, rules: Arc<RuleTable>) -> crate::Result<Self> {
        let remote = RemoteEndpoint::parse(&settings.remote)?;
        let security = Arc::new(Security::new(&settings.passkey)?);
        let tls = if remote.tls { Some(tls_connector()?) } else { None };

        let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;

        Ok(Self {
            listener,
            inner: Arc::new(Inner { rules, security, remote, tls }),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop, one task per client connection.
    pub fn start(self) -> ProxyHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(self.listener, self.inner, stop_rx));
        ProxyHandle { stop_tx, task }
    }
}

fn tls_connector() -> Result<tokio_rustls::TlsConnector, TunnelError> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

fn keepalive(stream: &TcpStream) {
    let ka = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    let _ = SockRef::from(stream).set_tcp_keepalive(&ka);
}

async fn accept_loop(listener: TcpListener, inner: Arc<Inner>, mut stop_rx: oneshot::Receiver<()>) {
    match listener.local_addr() {
        Ok(addr) => info!(
            "proxy on {} {} {}://{}:{}",
            addr,
            inner.rules.mode(),
            if inner.remote.tls { "https" } else { "http" },
            inner.remote.host,
            inner.remote.port
        ),
        Err(_) => info!("proxy listening"),
    }

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("proxy stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        handle_client(inner, stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }
    }
}

/// Run one client connection from greeting to teardown. Protocol violations
/// abort silently; the warn log is the only trace they leave.
async fn handle_client(inner: Arc<Inner>, mut stream: TcpStream, peer: SocketAddr) {
    keepalive(&stream);

    let mut buf = [0u8; 255];

    // Method selection  https://tools.ietf.org/html/rfc1928
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    if stream.read_exact(&mut buf[..2]).await.is_err() {
        return;
    }
    if buf[0] != SOCKS_VERSION {
        return;
    }
    let nmethods = buf[1] as usize;
    if stream.read_exact(&mut buf[..nmethods]).await.is_err() {
        return;
    }

    // no authentication required, always
    if stream.write_all(&[SOCKS_VERSION, 0x00]).await.is_err() {
        return;
    }

    // Request
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    if stream.read_exact(&mut buf[..3]).await.is_err() {
        return;
    }
    let cmd = buf[1];

    let addr = match Addr::read(&mut stream).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!("address read failed: {e}");
            return;
        }
    };

    let mode = inner.rules.resolve(&addr.host());

    if cmd != CMD_CONNECT {
        let _ = reply(&mut stream, REP_CMD_NOT_SUPPORTED).await;
        return;
    }
    let rep = if mode == Mode::Drop { REP_NOT_ALLOWED } else { REP_SUCCEEDED };
    if reply(&mut stream, rep).await.is_err() {
        return;
    }

    route(inner, stream, peer, addr, mode).await;
}

/// Reply
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
async fn reply(stream: &mut TcpStream, rep: u8) -> io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Dial per the resolved mode and relay until done.
async fn route(inner: Arc<Inner>, client: TcpStream, peer: SocketAddr, addr: Addr, mode: Mode) {
    info!("{mode} {peer} -> {addr}");

    if mode == Mode::Drop {
        return;
    }

    let mut effective = mode;
    let upstream: Box<dyn Stream> = match mode {
        Mode::Drop => return,
        Mode::Direct => match TcpStream::connect(addr.to_string()).await {
            Ok(s) => Box::new(s),
            Err(e) => {
                warn!("dial {mode} {addr} failed: {e}");
                return;
            }
        },
        Mode::Tunnel => match dial_remote(&inner, &addr).await {
            Ok(s) => Box::new(s),
            Err(e) => {
                warn!("dial {mode} {addr} failed: {e}");
                return;
            }
        },
        // No rule matched: try the target directly, but a dial that times
        // out degrades to the tunnel path instead of failing the client.
        Mode::Rule => match timeout(DIRECT_DIAL_TIMEOUT, TcpStream::connect(addr.to_string())).await
        {
            Ok(Ok(s)) => Box::new(s),
            Ok(Err(e)) if e.kind() != io::ErrorKind::TimedOut => {
                warn!("dial {mode} {addr} failed: {e}");
                return;
            }
            _ => {
                effective = Mode::Tunnel;
                match dial_remote(&inner, &addr).await {
                    Ok(s) => Box::new(s),
                    Err(e) => {
                        warn!("dial {effective} {addr} failed: {e}");
                        return;
                    }
                }
            }
        },
    };

    let (to_client, to_target, err) = relay::relay(upstream, client, IDLE_TIMEOUT).await;
    if let Some(e) = err {
        warn!("relay {addr} failed: {e}");
    }
    info!("{effective} {peer} -> {addr} <{to_client} {to_target}>");
}

/// Open a tunnel session to the remote endpoint and announce the target as
/// the session's first frame.
async fn dial_remote(inner: &Inner, addr: &Addr) -> Result<SecureStream<Box<dyn Stream>>, ProxyError> {
    let tcp = TcpStream::connect((inner.remote.host.as_str(), inner.remote.port)).await?;
    let tcp_peer = tcp.peer_addr()?;
    keepalive(&tcp);

    let mut io: Box<dyn Stream> = match &inner.tls {
        Some(connector) => {
            let name = rustls::pki_types::ServerName::try_from(inner.remote.host.clone())
                .map_err(|e| TunnelError::Tls(e.to_string()))?;
            Box::new(connector.connect(name, tcp).await?)
        }
        None => Box::new(tcp),
    };

    upgrade::connect(&mut io, &inner.remote.host_header()).await?;

    let mut secure = SecureStream::new(io, Arc::clone(&inner.security), tcp_peer);
    secure.write_all(addr.as_bytes()).await?;
    secure.flush().await?;
    Ok(secure)
}
