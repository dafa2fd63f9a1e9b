//! Test certificate generation using rcgen
//!
//! Produces the certificate/key pairs a TLS-mode trust server is started with,
//! at runtime, so no pre-generated fixture files are needed.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use trustprobe_common::HarnessError;

use crate::trust_server::TlsMaterial;

/// File name the certificate is written under
pub const CERT_FILE: &str = "test-tls.crt";

/// File name the private key is written under
pub const KEY_FILE: &str = "test-tls.key";

/// File name the signing CA is written under
pub const CA_FILE: &str = "test-ca.crt";

/// A server certificate plus the CA that signed it, if any
#[derive(Clone, Debug)]
pub struct TestCertificates {
    /// Common name of the server certificate
    pub common_name: String,
    /// Server certificate PEM
    pub cert_pem: String,
    /// Server private key PEM
    pub key_pem: String,
    /// CA certificate PEM (None for self-signed certificates)
    pub ca_cert_pem: Option<String>,
}

fn certificate_error(context: &str, e: rcgen::Error) -> HarnessError {
    HarnessError::Certificate(format!("{}: {}", context, e))
}

/// Leaf parameters: P-384 key, ten-year validity, SAN for the loopback IP
fn server_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn
    };
    params.subject_alt_names = vec![SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST))];
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2034, 1, 1);
    params
}

impl TestCertificates {
    /// Generate a self-signed certificate nobody trusts.
    ///
    /// Equivalent to
    /// `openssl req -x509 -newkey ec -pkeyopt ec_paramgen_curve:secp384r1 -days 3650
    /// -nodes -subj "/CN=<cn>" -addext "subjectAltName=IP:127.0.0.1"`.
    pub fn self_signed(common_name: &str) -> Result<Self, HarnessError> {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| certificate_error("Failed to generate key", e))?;
        let cert = server_params(common_name)
            .self_signed(&key)
            .map_err(|e| certificate_error("Failed to self-sign certificate", e))?;

        Ok(Self {
            common_name: common_name.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            ca_cert_pem: None,
        })
    }

    /// Generate a CA and a server certificate signed by it.
    ///
    /// A client given `ca_cert_pem` as its only root accepts this server.
    pub fn ca_signed(common_name: &str) -> Result<Self, HarnessError> {
        let ca_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| certificate_error("Failed to generate CA key", e))?;

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "trustprobe Test CA");
            dn
        };
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .map_err(|e| certificate_error("Failed to create CA cert", e))?;
        let ca_issuer = Issuer::new(ca_params, ca_key);

        let server_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .map_err(|e| certificate_error("Failed to generate server key", e))?;
        let mut params = server_params(common_name);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let server_cert = params
            .signed_by(&server_key, &ca_issuer)
            .map_err(|e| certificate_error("Failed to create server cert", e))?;

        Ok(Self {
            common_name: common_name.to_string(),
            cert_pem: server_cert.pem(),
            key_pem: server_key.serialize_pem(),
            ca_cert_pem: Some(ca_cert.pem()),
        })
    }

    /// Write the certificate and key into `dir` and return their paths
    pub fn write_to(&self, dir: &Path) -> Result<TlsMaterial, HarnessError> {
        let cert_path = dir.join(CERT_FILE);
        let key_path = dir.join(KEY_FILE);
        fs::write(&cert_path, &self.cert_pem)?;
        fs::write(&key_path, &self.key_pem)?;
        tracing::debug!("Wrote {} and {} to {:?}", CERT_FILE, KEY_FILE, dir);
        Ok(TlsMaterial::files(cert_path, key_path))
    }

    /// The certificate and key as in-memory server material
    pub fn pem_material(&self) -> TlsMaterial {
        TlsMaterial::Pem {
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
        }
    }

    /// Write the signing CA into `dir`, for clients that load roots from a file
    pub fn write_ca_to(&self, dir: &Path) -> Result<PathBuf, HarnessError> {
        let ca_pem = self.ca_cert_pem.as_deref().ok_or_else(|| {
            HarnessError::Certificate(format!("{} is self-signed and has no CA", self.common_name))
        })?;
        let ca_path = dir.join(CA_FILE);
        fs::write(&ca_path, ca_pem)?;
        Ok(ca_path)
    }
}
