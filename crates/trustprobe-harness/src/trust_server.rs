//! Local HTTP(S) server for observing a client's transport trust
//!
//! Every request that reaches the handler is recorded by path and answered
//! with a fixed body. A client that refuses the server's certificate, or
//! refuses to speak TLS-less HTTP, never gets that far, so an empty log is
//! the evidence that trust was enforced.

use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use trustprobe_common::HarnessError;

/// Default body returned for every request
pub const RESPONSE_BODY: &[u8] = b"Hello";

/// Certificate and key for TLS mode
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsMaterial {
    /// PEM files on disk
    Files { cert_path: PathBuf, key_path: PathBuf },
    /// PEM held in memory
    Pem { cert_pem: String, key_pem: String },
}

impl TlsMaterial {
    pub fn files(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        TlsMaterial::Files {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }

    fn server_config(&self) -> Result<rustls::ServerConfig, HarnessError> {
        match self {
            TlsMaterial::Files {
                cert_path,
                key_path,
            } => trustprobe_common::load_server_config(cert_path, key_path),
            TlsMaterial::Pem { cert_pem, key_pem } => {
                trustprobe_common::load_server_config_from_pem(cert_pem, key_pem)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrustServerConfig {
    /// Address to bind; port 0 lets the OS pick
    pub bind_addr: SocketAddr,
    /// Serve TLS with this material, plaintext when None
    pub tls: Option<TlsMaterial>,
    /// Body every request is answered with
    pub response_body: Bytes,
}

impl Default for TrustServerConfig {
    fn default() -> Self {
        Self::plaintext()
    }
}

impl TrustServerConfig {
    /// Plaintext HTTP on an ephemeral loopback port
    pub fn plaintext() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            tls: None,
            response_body: Bytes::from_static(RESPONSE_BODY),
        }
    }

    /// HTTPS on an ephemeral loopback port
    pub fn tls(material: TlsMaterial) -> Self {
        Self {
            tls: Some(material),
            ..Self::plaintext()
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_response_body(mut self, body: impl Into<Bytes>) -> Self {
        self.response_body = body.into();
        self
    }
}

/// Paths of requests served, in arrival order
#[derive(Clone, Debug, Default)]
pub struct RequestLog {
    paths: Arc<Mutex<Vec<String>>>,
}

impl RequestLog {
    pub fn record(&self, path: impl Into<String>) {
        self.paths.lock().push(path.into());
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}

/// Abnormal termination of the serve loop
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("serve loop ended without reporting")]
    Aborted,
}

/// One-shot completion of the serve loop.
///
/// `Ok(())` means the server was closed on purpose.
#[derive(Debug)]
pub struct ServeCompletion {
    rx: oneshot::Receiver<Result<(), ServeError>>,
}

impl ServeCompletion {
    /// Wait for the serve loop to end; can only be read once
    pub async fn wait(self) -> Result<(), ServeError> {
        self.rx.await.unwrap_or(Err(ServeError::Aborted))
    }
}

/// A running trust server
pub struct TrustServer {
    addr: SocketAddr,
    tls_enabled: bool,
    requests: RequestLog,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TrustServer {
    /// Bind and start serving in the background.
    ///
    /// TLS material is loaded and the listener bound before this returns, so
    /// setup failures are reported here rather than through the completion.
    pub async fn start(config: TrustServerConfig) -> Result<(Self, ServeCompletion), HarnessError> {
        let acceptor = match &config.tls {
            Some(material) => Some(TlsAcceptor::from(Arc::new(material.server_config()?))),
            None => None,
        };

        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| HarnessError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        if acceptor.is_some() {
            tracing::info!("Trust server listening on https://{}", addr);
        } else {
            tracing::info!("Trust server listening on http://{}", addr);
        }

        let requests = RequestLog::default();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let tls_enabled = acceptor.is_some();
        let log = requests.clone();
        let body = config.response_body;
        tokio::spawn(async move {
            let result = serve(listener, acceptor, log, body, shutdown_rx).await;
            let _ = done_tx.send(result);
        });

        Ok((
            Self {
                addr,
                tls_enabled,
                requests,
                shutdown_tx: Some(shutdown_tx),
            },
            ServeCompletion { rx: done_rx },
        ))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    /// Shared handle to the request log
    pub fn request_log(&self) -> RequestLog {
        self.requests.clone()
    }

    /// Paths recorded so far; complete once the completion has been received
    pub fn recorded_paths(&self) -> Vec<String> {
        self.requests.paths()
    }

    /// Close the listener and drop open connections.
    ///
    /// Returns false if the server was already stopped.
    pub fn stop(&mut self) -> bool {
        match self.shutdown_tx.take() {
            Some(tx) => {
                tracing::debug!("Stopping trust server on {}", self.addr);
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

impl Drop for TrustServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    log: RequestLog,
    body: Bytes,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), ServeError> {
    let mut connections = JoinSet::new();

    let result = loop {
        tokio::select! {
            // A dropped sender stops the server too
            _ = &mut shutdown_rx => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    connections.spawn(handle_connection(
                        stream,
                        peer_addr,
                        acceptor.clone(),
                        log.clone(),
                        body.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    break Err(ServeError::Accept(e));
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    };

    drop(listener);
    connections.shutdown().await;
    tracing::debug!("Trust server closed");
    result
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    log: RequestLog,
    body: Bytes,
) {
    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve_connection(tls_stream, peer_addr, log, body).await,
            // Client-side trust failures end here; not a server error
            Err(e) => tracing::debug!("TLS handshake failed from {}: {}", peer_addr, e),
        },
        None => serve_connection(stream, peer_addr, log, body).await,
    }
}

/// Serve HTTP/1.1 on any AsyncRead + AsyncWrite stream
async fn serve_connection<S>(stream: S, peer_addr: SocketAddr, log: RequestLog, body: Bytes)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let log = log.clone();
        let body = body.clone();
        async move {
            tracing::debug!("{} {}", req.method(), req.uri());
            log.record(req.uri().path());
            Ok::<_, Infallible>(Response::new(Full::new(body)))
        }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trust_server_basic() {
        let (mut server, completion) = TrustServer::start(TrustServerConfig::plaintext())
            .await
            .unwrap();
        assert!(!server.is_tls());
        assert!(server.addr().ip().is_loopback());

        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let resp = client
            .post(format!("http://{}/v2/some/path?x=1", server.addr()))
            .body("ignored")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), RESPONSE_BODY);

        assert!(server.stop());
        completion.wait().await.unwrap();
        assert_eq!(server.recorded_paths(), vec!["/v2/some/path".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut server, completion) = TrustServer::start(TrustServerConfig::plaintext())
            .await
            .unwrap();

        assert!(server.stop());
        assert!(!server.stop());
        completion.wait().await.unwrap();
        assert!(!server.stop());
        assert!(server.recorded_paths().is_empty());
    }

    #[tokio::test]
    async fn test_drop_stops_server() {
        let (server, completion) = TrustServer::start(TrustServerConfig::plaintext())
            .await
            .unwrap();
        let addr = server.addr();
        drop(server);

        completion.wait().await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let (server, _completion) = TrustServer::start(TrustServerConfig::plaintext())
            .await
            .unwrap();

        let err = TrustServer::start(TrustServerConfig::plaintext().with_bind_addr(server.addr()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HarnessError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_missing_tls_material_is_reported() {
        let config = TrustServerConfig::tls(TlsMaterial::files(
            "/nonexistent/test-tls.crt",
            "/nonexistent/test-tls.key",
        ));

        let err = TrustServer::start(config).await.err().unwrap();
        assert!(matches!(err, HarnessError::Certificate(_)));
    }

    #[tokio::test]
    async fn test_invalid_pem_material_is_reported() {
        let config = TrustServerConfig::tls(TlsMaterial::Pem {
            cert_pem: String::new(),
            key_pem: String::new(),
        });

        let err = TrustServer::start(config).await.err().unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[tokio::test]
    async fn test_custom_response_body() {
        let config = TrustServerConfig::plaintext().with_response_body("20241011\n");
        let (server, _completion) = TrustServer::start(config).await.unwrap();

        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let body = client
            .get(format!("http://{}/testimage-id", server.addr()))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "20241011\n");
    }
}
