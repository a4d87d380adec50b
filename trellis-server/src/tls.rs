//! TLS identity handling.
//!
//! Listeners present the daemon identity and *offer* (never require) client
//! authentication: any presented client certificate is accepted at the
//! handshake and captured, because authentication happens later as a DER
//! byte-equality check against the controller certificate each instance
//! trusts. Chain building and CA validation are deliberately not involved.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use x509_parser::prelude::FromDer;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificate found in PEM data")]
    NoCertificate,

    #[error("no private key found in PEM data")]
    NoKey,

    #[error("malformed PEM data: {0}")]
    Pem(String),

    #[error("certificate is not valid DER: {0}")]
    BadCertificate(String),

    #[error("unusable certificate/key pair: {0}")]
    BadIdentity(String),
}

pub fn read_certs_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate);
    }
    for cert in &certs {
        x509_parser::certificate::X509Certificate::from_der(cert.as_ref())
            .map_err(|e| TlsError::BadCertificate(e.to_string()))?;
    }
    Ok(certs)
}

pub fn read_key_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| TlsError::Pem(e.to_string()))?
        .ok_or(TlsError::NoKey)
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// DER bytes of the first certificate in a PEM blob, for exact-match
/// comparison against presented client certificates.
pub fn cert_der(pem: &[u8]) -> Result<Vec<u8>, TlsError> {
    let certs = read_certs_pem(pem)?;
    Ok(certs[0].as_ref().to_vec())
}

/// Check that a certificate/key PEM pair forms a usable server identity.
pub fn validate_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<(), TlsError> {
    let certs = read_certs_pem(cert_pem)?;
    let key = read_key_pem(key_pem)?;
    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::BadIdentity(e.to_string()))?;
    Ok(())
}

/// Credentials delivered as one PEM blob: the instance certificate, then its
/// private key, then the controller certificate. Split on the private-key
/// block boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCredentials {
    pub cert_pem: String,
    pub key_pem: String,
    pub controller_pem: String,
}

pub fn split_credentials_pem(blob: &str) -> Result<SplitCredentials, TlsError> {
    let is_key_boundary =
        |line: &str, edge: &str| line.starts_with(edge) && line.contains("PRIVATE KEY");

    let mut cert = String::new();
    let mut key = String::new();
    let mut controller = String::new();
    let mut section = 0;

    for line in blob.lines() {
        if section == 0 && is_key_boundary(line, "-----BEGIN") {
            section = 1;
        }
        match section {
            0 => {
                cert.push_str(line);
                cert.push('\n');
            }
            1 => {
                key.push_str(line);
                key.push('\n');
                if is_key_boundary(line, "-----END") {
                    section = 2;
                }
            }
            _ => {
                controller.push_str(line);
                controller.push('\n');
            }
        }
    }

    if section == 0 {
        return Err(TlsError::NoKey);
    }
    if section == 1 {
        return Err(TlsError::Pem("unterminated private key block".to_string()));
    }
    if cert.trim().is_empty() || controller.trim().is_empty() {
        return Err(TlsError::NoCertificate);
    }

    Ok(SplitCredentials {
        cert_pem: cert,
        key_pem: key,
        controller_pem: controller,
    })
}

/// Listener TLS configuration: daemon identity from the given PEM files,
/// client certificates offered and captured but never verified here.
pub fn listener_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = read_certs_pem(&read_file(cert_path)?)?;
    let key = read_key_pem(&read_file(key_path)?)?;

    let verifier = Arc::new(CaptureClientCerts::new());
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::BadIdentity(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Accepts any client certificate so the connection layer can hand its DER
/// bytes to the instance equality check.
#[derive(Debug)]
struct CaptureClientCerts {
    provider: Arc<CryptoProvider>,
}

impl CaptureClientCerts {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }
}

impl ClientCertVerifier for CaptureClientCerts {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
