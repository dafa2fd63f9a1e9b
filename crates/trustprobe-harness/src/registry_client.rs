//! Trust-enforcing registry ping client
//!
//! Connects to `https://<addr>/v2/` the way a container tool pings a registry
//! before pulling, and reports failures in that tool's wording so the text can
//! be compared against the expectation table.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::HOST;
use hyper::Request;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::CertificateError;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use trustprobe_common::HarnessError;

use crate::scenario::{ClientOutcome, ClientUnderTest};

/// Default deadline for the whole ping
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Path every registry ping requests
pub const PING_PATH: &str = "/v2/";

/// Bytes a plaintext HTTP server answers a ClientHello with
const HTTP_PREFIX: &[u8] = b"HTTP/";

/// Why a ping failed
#[derive(Debug, Error)]
pub enum PingFailure {
    #[error("http: server gave HTTP response to HTTPS client")]
    HttpResponseToHttps,

    #[error("tls: failed to verify certificate: x509: certificate signed by unknown authority")]
    UnknownAuthority,

    #[error("tls: failed to verify certificate: x509: {0}")]
    Certificate(String),

    #[error("dial tcp: {0}")]
    Connect(#[source] io::Error),

    #[error("tls handshake: {0}")]
    Handshake(#[source] io::Error),

    #[error("{0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("timeout awaiting response")]
    Timeout,
}

/// A failed ping against one registry
#[derive(Debug, Error)]
#[error("pinging container registry {registry}: Get \"https://{registry}/v2/\": {cause}")]
pub struct RegistryError {
    pub registry: SocketAddr,
    #[source]
    pub cause: PingFailure,
}

/// Response to a ping that passed TLS verification
#[derive(Clone, Debug)]
pub struct PingResponse {
    pub status: u16,
    pub body: Bytes,
}

/// Client side of a trust check
#[derive(Clone)]
pub struct RegistryClient {
    connector: TlsConnector,
    timeout: Duration,
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    pub fn new(tls_config: rustls::ClientConfig, timeout: Duration) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(tls_config)),
            timeout,
        }
    }

    /// A client with no trusted roots
    pub fn untrusting(timeout: Duration) -> Result<Self, HarnessError> {
        let tls_config = trustprobe_common::load_client_config_from_pem(None)?;
        Ok(Self::new(tls_config, timeout))
    }

    /// A client trusting only the CA in `ca_pem`
    pub fn trusting(ca_pem: &str, timeout: Duration) -> Result<Self, HarnessError> {
        let tls_config = trustprobe_common::load_client_config_from_pem(Some(ca_pem))?;
        Ok(Self::new(tls_config, timeout))
    }

    /// A client trusting only the CAs in the PEM file at `ca_path`
    pub fn trusting_file(ca_path: &Path, timeout: Duration) -> Result<Self, HarnessError> {
        let tls_config = trustprobe_common::load_client_config(Some(ca_path))?;
        Ok(Self::new(tls_config, timeout))
    }

    /// Ping `https://<registry>/v2/`
    pub async fn ping(&self, registry: SocketAddr) -> Result<PingResponse, RegistryError> {
        let result = match tokio::time::timeout(self.timeout, self.ping_inner(registry)).await {
            Ok(result) => result,
            Err(_) => Err(PingFailure::Timeout),
        };
        result.map_err(|cause| {
            tracing::debug!("Ping of {} failed: {}", registry, cause);
            RegistryError { registry, cause }
        })
    }

    async fn ping_inner(&self, registry: SocketAddr) -> Result<PingResponse, PingFailure> {
        let tcp = TcpStream::connect(registry)
            .await
            .map_err(PingFailure::Connect)?;

        let stream = SniffStream::new(tcp);
        let prefix = stream.prefix();
        let server_name = ServerName::IpAddress(registry.ip().into());

        let tls_stream = match self.connector.connect(server_name, stream).await {
            Ok(tls_stream) => tls_stream,
            Err(e) => return Err(classify_handshake_error(e, &prefix.lock())),
        };

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(tls_stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Registry connection error: {}", e);
            }
        });

        let req = Request::get(PING_PATH)
            .header(HOST, registry.to_string())
            .body(Empty::<Bytes>::new())?;
        let resp = sender.send_request(req).await?;
        let status = resp.status().as_u16();
        let body = resp.into_body().collect().await?.to_bytes();

        tracing::debug!("Registry {} answered {}", registry, status);
        Ok(PingResponse { status, body })
    }
}

#[async_trait]
impl ClientUnderTest for RegistryClient {
    async fn fetch(&self, registry: SocketAddr) -> ClientOutcome {
        match self.ping(registry).await {
            Ok(_) => ClientOutcome::Accepted,
            Err(e) => ClientOutcome::Rejected {
                stderr: crate::expectations::render_cli_error(&e),
            },
        }
    }
}

/// Map a failed handshake to the wording a registry client reports
fn classify_handshake_error(err: io::Error, prefix: &[u8]) -> PingFailure {
    if prefix.starts_with(HTTP_PREFIX) {
        return PingFailure::HttpResponseToHttps;
    }

    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)) => {
            PingFailure::UnknownAuthority
        }
        Some(rustls::Error::InvalidCertificate(other)) => {
            PingFailure::Certificate(describe_certificate_error(other))
        }
        _ => PingFailure::Handshake(err),
    }
}

fn describe_certificate_error(err: &CertificateError) -> String {
    match err {
        CertificateError::Expired | CertificateError::NotValidYet => {
            "certificate has expired or is not yet valid".to_string()
        }
        CertificateError::NotValidForName => {
            "certificate is not valid for the requested name".to_string()
        }
        CertificateError::BadSignature => "certificate signature is invalid".to_string(),
        CertificateError::BadEncoding => "malformed certificate".to_string(),
        CertificateError::Revoked => "certificate has been revoked".to_string(),
        CertificateError::InvalidPurpose => {
            "certificate specifies an incompatible key usage".to_string()
        }
        CertificateError::UnhandledCriticalExtension => {
            "unhandled critical extension".to_string()
        }
        other => rustls::Error::InvalidCertificate(other.clone()).to_string(),
    }
}

/// Keeps the first bytes the server sends so a failed handshake can tell
/// a plaintext HTTP reply apart from a real TLS error.
struct SniffStream<S> {
    inner: S,
    prefix: Arc<Mutex<Vec<u8>>>,
}

impl<S> SniffStream<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            prefix: Arc::new(Mutex::new(Vec::with_capacity(HTTP_PREFIX.len()))),
        }
    }

    fn prefix(&self) -> Arc<Mutex<Vec<u8>>> {
        self.prefix.clone()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = poll {
            let mut prefix = this.prefix.lock();
            let missing = HTTP_PREFIX.len().saturating_sub(prefix.len());
            if missing > 0 {
                let fresh = &buf.filled()[before..];
                prefix.extend_from_slice(&fresh[..missing.min(fresh.len())]);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
