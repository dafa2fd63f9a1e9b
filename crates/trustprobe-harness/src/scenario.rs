//! One transport-trust check, start to finish
//!
//! Starts a [`TrustServer`], points the client under test at it, stops the
//! server and only then inspects what the server saw and what the client said.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use trustprobe_common::HarnessError;

use crate::expectations::{expected_pull_error, Platform, TrustFailure};
use crate::trust_server::{ServeError, TlsMaterial, TrustServer, TrustServerConfig};

/// What the client did when pointed at the trust server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientOutcome {
    /// The client talked to the server
    Accepted,
    /// The client refused, printing `stderr`
    Rejected { stderr: String },
}

/// A client whose trust enforcement is being checked
#[async_trait]
pub trait ClientUnderTest: Send + Sync {
    async fn fetch(&self, registry: SocketAddr) -> ClientOutcome;
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to start trust server: {0}")]
    Setup(#[from] HarnessError),

    #[error("trust server terminated abnormally: {0}")]
    Serve(#[from] ServeError),

    #[error("client accepted an untrusted server")]
    ClientAccepted,

    #[error("unexpected client error\nexpected: {expected:?}\n  actual: {actual:?}")]
    ErrorMismatch { expected: String, actual: String },

    #[error("server processed requests it should never have seen: {0:?}")]
    RequestsLogged(Vec<String>),
}

/// Evidence from a passing scenario
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustReport {
    pub registry: SocketAddr,
    pub stderr: String,
}

#[derive(Clone, Debug)]
pub struct TrustScenario {
    /// None runs the server in plaintext
    pub tls: Option<TlsMaterial>,
    pub expectation: TrustFailure,
    pub platform: Platform,
}

impl TrustScenario {
    /// Plaintext server; the client must refuse to speak HTTP
    pub fn plaintext(platform: Platform) -> Self {
        Self {
            tls: None,
            expectation: TrustFailure::PlaintextServer,
            platform,
        }
    }

    /// TLS server with an unverifiable certificate named `cert_name`
    pub fn untrusted(material: TlsMaterial, cert_name: impl Into<String>, platform: Platform) -> Self {
        Self {
            tls: Some(material),
            expectation: TrustFailure::UntrustedCertificate {
                cert_name: cert_name.into(),
            },
            platform,
        }
    }

    pub async fn run(&self, client: &dyn ClientUnderTest) -> Result<TrustReport, ScenarioError> {
        let config = match &self.tls {
            Some(material) => TrustServerConfig::tls(material.clone()),
            None => TrustServerConfig::plaintext(),
        };
        let (mut server, completion) = TrustServer::start(config).await?;
        let registry = server.addr();

        let outcome = client.fetch(registry).await;

        // The log is only complete once the serve loop has reported
        server.stop();
        completion.wait().await?;

        let logged = server.recorded_paths();
        if !logged.is_empty() {
            tracing::warn!("Trust server on {} logged {:?}", registry, logged);
            return Err(ScenarioError::RequestsLogged(logged));
        }

        let stderr = match outcome {
            ClientOutcome::Accepted => return Err(ScenarioError::ClientAccepted),
            ClientOutcome::Rejected { stderr } => stderr,
        };

        let expected = expected_pull_error(registry, &self.expectation, self.platform);
        if stderr != expected {
            return Err(ScenarioError::ErrorMismatch {
                expected,
                actual: stderr,
            });
        }

        tracing::info!("Client rejected {} as expected", registry);
        Ok(TrustReport { registry, stderr })
    }
}
