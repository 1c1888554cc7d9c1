//! Control-plane plumbing shared by the gamestream and admin listeners.
//!
//! Three listeners run over the same machinery: plain gamestream HTTP
//! (pairing + `serverinfo` only), mutual-TLS gamestream HTTPS, and the
//! admin HTTPS API. Each accepted connection is served by a per-connection
//! clone of an axum router, annotated with the peer's identity and the
//! connection's addresses via request extensions.

pub mod admin;
pub mod gamestream;
pub mod xml;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

use lumen_protocol::{HostContext, PairedClient};

/// How the shutdown was requested; decides the process exit code, which
/// tells the supervisor whether to respawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Do not respawn.
    Quit,
    /// Respawn requested from the admin API.
    Restart,
}

/// Who is on the other end of a request.
#[derive(Clone)]
pub enum PeerIdentity {
    /// Plain listener: only `serverinfo` and `pair` are meaningful.
    Anonymous,
    /// TLS listener, certificate matched a paired client.
    Authenticated(PairedClient),
    /// TLS listener, certificate presented but unknown. Every route
    /// answers 401.
    Unverified,
}

/// Remote/local addresses of the underlying connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnInfo {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

/// A PIN submitted through the admin API.
#[derive(Debug)]
pub struct PinSubmission {
    pub pin: String,
    pub name: String,
}

struct PendingPin {
    unique_id: String,
    tx: oneshot::Sender<PinSubmission>,
}

/// Rendezvous between a parked `/pair` response and `POST /api/pin`.
///
/// One pairing attempt is pending at a time; a newer attempt replaces an
/// older one (whose response then completes with a failure).
#[derive(Default)]
pub struct PinGate {
    pending: StdMutex<Option<PendingPin>>,
}

impl PinGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Park a pairing attempt; the returned receiver completes when the
    /// admin supplies a PIN.
    pub fn park(&self, unique_id: &str) -> oneshot::Receiver<PinSubmission> {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().unwrap().replace(PendingPin {
            unique_id: unique_id.to_string(),
            tx,
        });
        if previous.is_some() {
            debug!("replacing a previously parked pairing attempt");
        }
        rx
    }

    /// Deliver a PIN to the parked attempt. Returns the attempt's
    /// `uniqueid`, or `None` when nothing was waiting.
    pub fn submit(&self, pin: &str, name: &str) -> Option<String> {
        let pending = self.pending.lock().unwrap().take()?;
        let unique_id = pending.unique_id.clone();
        pending
            .tx
            .send(PinSubmission { pin: pin.to_string(), name: name.to_string() })
            .ok()?;
        Some(unique_id)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }
}

/// Gamestream listener state.
#[derive(Clone)]
pub struct GsState {
    pub ctx: Arc<HostContext>,
    pub pin_gate: Arc<PinGate>,
    /// `localAudioPlayMode` is sticky: `resume` does not always carry it.
    pub host_audio: Arc<AtomicBool>,
}

/// Admin session cookie, hashed server-side.
pub struct SessionCookie {
    pub hashed: String,
    pub created: Instant,
}

/// Admin listener state.
#[derive(Clone)]
pub struct AdminState {
    pub ctx: Arc<HostContext>,
    pub pin_gate: Arc<PinGate>,
    pub cookie: Arc<StdMutex<Option<SessionCookie>>>,
    pub exit_tx: mpsc::UnboundedSender<ExitKind>,
}

/// Build a TLS acceptor from the host credentials. With `verify_client`
/// the peer must present a certificate; verification is deferred so an
/// unknown client still gets a diagnostic 401 over the connection.
pub fn build_tls_acceptor(cert_pem: &str, key_pem: &str, verify_client: bool) -> Result<SslAcceptor> {
    let cert = X509::from_pem(cert_pem.as_bytes()).context("parsing host certificate")?;
    let key = PKey::private_key_from_pem(key_pem.as_bytes()).context("parsing host key")?;

    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls_server())
        .context("creating TLS acceptor")?;
    builder.set_certificate(&cert)?;
    builder.set_private_key(&key)?;
    builder.check_private_key()?;
    if verify_client {
        builder.set_verify_callback(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            |_, _| true,
        );
    }
    Ok(builder.build())
}

async fn serve_connection<IO>(io: IO, router: Router, identity: PeerIdentity, conn: ConnInfo)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let router = router.layer(Extension(identity)).layer(Extension(conn));
    let service = TowerToHyperService::new(router);
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .await
    {
        debug!("connection from {} ended: {e}", conn.remote);
    }
}

/// Accept loop for the plain gamestream listener.
pub async fn serve_plain(listener: TcpListener, router: Router) {
    let local = listener.local_addr().ok();
    info!("plain listener on {:?}", local);
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(_) => continue,
        };
        let router = router.clone();
        tokio::spawn(async move {
            serve_connection(
                stream,
                router,
                PeerIdentity::Anonymous,
                ConnInfo { remote, local },
            )
            .await;
        });
    }
}

/// Accept loop for a TLS listener. With `verify_clients`, the peer
/// certificate is matched against the paired-client registry and the
/// request annotated accordingly.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: Arc<SslAcceptor>,
    router: Router,
    ctx: Arc<HostContext>,
    verify_clients: bool,
) {
    let local = listener.local_addr().ok();
    info!("TLS listener on {:?} (mutual auth: {verify_clients})", local);
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        let acceptor = Arc::clone(&acceptor);
        let router = router.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            handle_tls_connection(stream, remote, acceptor, router, ctx, verify_clients).await;
        });
    }
}

async fn handle_tls_connection(
    stream: TcpStream,
    remote: SocketAddr,
    acceptor: Arc<SslAcceptor>,
    router: Router,
    ctx: Arc<HostContext>,
    verify_clients: bool,
) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let ssl = match Ssl::new(acceptor.context()) {
        Ok(ssl) => ssl,
        Err(e) => {
            warn!("SSL setup failed: {e}");
            return;
        }
    };
    let mut tls = match SslStream::new(ssl, stream) {
        Ok(tls) => tls,
        Err(e) => {
            warn!("SSL stream setup failed: {e}");
            return;
        }
    };
    if let Err(e) = Pin::new(&mut tls).accept().await {
        debug!("TLS handshake with {remote} failed: {e}");
        return;
    }

    let identity = if verify_clients {
        match tls.ssl().peer_certificate() {
            Some(peer) => match ctx.clients.verify_peer(&peer) {
                Some(client) => {
                    debug!("peer verified, device name: {}", client.name);
                    PeerIdentity::Authenticated(client)
                }
                None => {
                    debug!("peer certificate from {remote} denied");
                    PeerIdentity::Unverified
                }
            },
            None => PeerIdentity::Unverified,
        }
    } else {
        PeerIdentity::Anonymous
    };

    serve_connection(tls, router, identity, ConnInfo { remote, local }).await;
}

/// MAC address of the first non-loopback interface, or the placeholder
/// clients know to ignore.
pub fn primary_mac_address() -> String {
    if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy() == "lo" {
                continue;
            }
            if let Ok(mac) = std::fs::read_to_string(entry.path().join("address")) {
                let mac = mac.trim().to_string();
                if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                    return mac;
                }
            }
        }
    }
    "00:00:00:00:00:00".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pin_gate_round_trip() {
        let gate = PinGate::new();
        assert!(!gate.has_pending());
        assert!(gate.submit("1234", "").is_none());

        let rx = gate.park("client-uid");
        assert!(gate.has_pending());
        assert_eq!(gate.submit("1234", "My PC").as_deref(), Some("client-uid"));

        let submission = rx.await.unwrap();
        assert_eq!(submission.pin, "1234");
        assert_eq!(submission.name, "My PC");
        assert!(!gate.has_pending());
    }

    #[tokio::test]
    async fn pin_gate_replacement_drops_old_waiter() {
        let gate = PinGate::new();
        let old_rx = gate.park("old");
        let _new_rx = gate.park("new");

        // The replaced attempt's sender was dropped.
        assert!(old_rx.await.is_err());
        assert_eq!(gate.submit("0000", "").as_deref(), Some("new"));
    }
}
