//! Exact error text a trust-enforcing client must print
//!
//! The wording differs by platform because macOS verifies certificates with
//! its own policy: it rejects long-lived certificates before it gets to the
//! issuer check.

use std::fmt;
use std::net::SocketAddr;

/// Platform whose certificate verifier produced the error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Darwin,
    Other,
}

impl Platform {
    /// The platform this binary was built for
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else {
            Platform::Other
        }
    }
}

/// The trust violation a scenario provokes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustFailure {
    /// Server speaks plain HTTP where HTTPS is required
    PlaintextServer,
    /// Server presents a certificate the client cannot verify
    UntrustedCertificate { cert_name: String },
}

/// The cause part of the error, without the registry prefix
pub fn expected_cause(failure: &TrustFailure, platform: Platform) -> String {
    match (failure, platform) {
        (TrustFailure::PlaintextServer, _) => {
            "http: server gave HTTP response to HTTPS client".to_string()
        }
        (TrustFailure::UntrustedCertificate { .. }, Platform::Other) => {
            "tls: failed to verify certificate: x509: certificate signed by unknown authority"
                .to_string()
        }
        (TrustFailure::UntrustedCertificate { cert_name }, Platform::Darwin) => format!(
            "tls: failed to verify certificate: x509: \u{201c}{}\u{201d} certificate is not standards compliant",
            cert_name
        ),
    }
}

/// Full stderr of a pull that was rejected while pinging `registry`
pub fn expected_pull_error(registry: SocketAddr, failure: &TrustFailure, platform: Platform) -> String {
    format!(
        "Error: pinging container registry {registry}: Get \"https://{registry}/v2/\": {}\n",
        expected_cause(failure, platform)
    )
}

/// Render an error the way a CLI reports it on stderr
pub fn render_cli_error(err: &dyn fmt::Display) -> String {
    format!("Error: {}\n", err)
}
