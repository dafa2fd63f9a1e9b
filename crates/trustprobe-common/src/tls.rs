use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::Path;

use crate::HarnessError;

/// Install the ring crypto provider as the process default.
///
/// Both the server and the client builders rely on a process-wide provider.
/// Calling this more than once is harmless.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn read_certs(reader: &mut dyn BufRead) -> Result<Vec<CertificateDer<'static>>, HarnessError> {
    let parsed = certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HarnessError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if parsed.is_empty() {
        return Err(HarnessError::Certificate(
            "No certificates found in PEM input".to_string(),
        ));
    }
    Ok(parsed)
}

fn read_private_key(reader: &mut dyn BufRead) -> Result<PrivateKeyDer<'static>, HarnessError> {
    private_key(reader)
        .map_err(|e| HarnessError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| HarnessError::Certificate("No private key found in PEM input".to_string()))
}

/// Load certificates from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, HarnessError> {
    let file = File::open(path).map_err(|e| {
        HarnessError::Certificate(format!("Failed to open cert file {:?}: {}", path, e))
    })?;
    read_certs(&mut BufReader::new(file))
}

/// Load a private key from a PEM file
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, HarnessError> {
    let file = File::open(path).map_err(|e| {
        HarnessError::Certificate(format!("Failed to open key file {:?}: {}", path, e))
    })?;
    read_private_key(&mut BufReader::new(file))
}

/// Load certificates from PEM content string
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, HarnessError> {
    read_certs(&mut Cursor::new(pem_content.as_bytes()))
}

/// Load a private key from PEM content string
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, HarnessError> {
    read_private_key(&mut Cursor::new(pem_content.as_bytes()))
}

fn root_store(ca_certs: Vec<CertificateDer<'static>>) -> Result<RootCertStore, HarnessError> {
    let mut root_store = RootCertStore::empty();
    for cert in ca_certs {
        root_store.add(cert).map_err(|e| {
            HarnessError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig, HarnessError> {
    install_crypto_provider();

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| HarnessError::Tls(format!("Failed to build server config: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

fn build_client_config(root_store: RootCertStore) -> ClientConfig {
    install_crypto_provider();

    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Load a server TLS config (no client authentication) from PEM files
///
/// # Arguments
/// * `cert_path` - Path to the server certificate chain
/// * `key_path` - Path to the server private key
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, HarnessError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    build_server_config(certs, key)
}

/// Load a server TLS config (no client authentication) from PEM strings
pub fn load_server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<ServerConfig, HarnessError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;
    build_server_config(certs, key)
}

/// Load a client TLS config trusting only the CA in `ca_path`.
///
/// `None` yields a client that trusts nothing, so every server certificate
/// fails verification with an unknown issuer.
pub fn load_client_config(ca_path: Option<&Path>) -> Result<ClientConfig, HarnessError> {
    let roots = match ca_path {
        Some(path) => root_store(load_certs(path)?)?,
        None => RootCertStore::empty(),
    };
    Ok(build_client_config(roots))
}

/// Load a client TLS config trusting only the CA in `ca_pem`
pub fn load_client_config_from_pem(ca_pem: Option<&str>) -> Result<ClientConfig, HarnessError> {
    let roots = match ca_pem {
        Some(pem) => root_store(load_certs_from_pem(pem)?)?,
        None => RootCertStore::empty(),
    };
    tracing::debug!("Client trusts {} root certificate(s)", roots.len());
    Ok(build_client_config(roots))
}
