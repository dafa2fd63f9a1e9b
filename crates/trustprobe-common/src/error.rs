use std::net::SocketAddr;

use thiserror::Error;

/// Setup errors shared by the probe, the trust server and the registry client
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP client error: {0}")]
    Client(String),
}
