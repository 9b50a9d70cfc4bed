//! TLS listener setup.
//!
//! Loads certificate/key PEM pairs and builds a `TlsAcceptor`,
//! optionally verifying client certificates against the configured CA
//! bundle (mTLS).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::pem::PemObject;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

/// TLS configuration assembled from the server config.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Server certificate/key PEM pairs as "cert.pem,key.pem".
    pub cert_key_pairs: Vec<String>,
    /// CA certificates for verifying client certs.
    pub client_cas: Vec<String>,
    /// Require client certificates (mTLS).
    pub require_client_certs: bool,
}

/// Errors that can occur when loading TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("no certificate/key pairs configured")]
    NoCertPairs,

    #[error("malformed cert-key pair '{0}', expected 'cert.pem,key.pem'")]
    MalformedPair(String),

    #[error("certificate file not found: {0}")]
    CertFileNotFound(String),

    #[error("private key file not found: {0}")]
    KeyFileNotFound(String),

    #[error("CA certificate file not found: {0}")]
    CaCertFileNotFound(String),

    #[error("failed to read certificate file: {0}")]
    CertReadError(#[source] std::io::Error),

    #[error("failed to parse PEM data: {0}")]
    PemError(String),

    #[error("no certificates found in file: {0}")]
    NoCertsFound(String),

    #[error("failed to build TLS config: {0}")]
    ConfigError(#[from] rustls::Error),

    #[error("failed to build client verifier: {0}")]
    VerifierError(String),
}

/// Builds a `TlsAcceptor` from the settings.
///
/// The first cert/key pair is the server identity. When client CAs are
/// configured, client certificates are verified against them; with
/// `require_client_certs`, unauthenticated clients are rejected.
pub fn load_tls_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, TlsError> {
    let pair = settings
        .cert_key_pairs
        .first()
        .ok_or(TlsError::NoCertPairs)?;
    let (cert_file, key_file) = pair
        .split_once(',')
        .ok_or_else(|| TlsError::MalformedPair(pair.clone()))?;
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    let cert_path = Path::new(cert_file);
    if !cert_path.exists() {
        return Err(TlsError::CertFileNotFound(cert_file.into()));
    }
    let reader = BufReader::new(File::open(cert_path).map_err(TlsError::CertReadError)?);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::PemError(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertsFound(cert_file.into()));
    }

    let key_path = Path::new(key_file);
    if !key_path.exists() {
        return Err(TlsError::KeyFileNotFound(key_file.into()));
    }
    let reader = BufReader::new(File::open(key_path).map_err(TlsError::CertReadError)?);
    let key: PrivateKeyDer<'static> = PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PemError(e.to_string()))?;

    let server_config = if settings.client_cas.is_empty() {
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?
    } else {
        let mut root_store = RootCertStore::empty();
        for ca_file in &settings.client_cas {
            let ca_path = Path::new(ca_file);
            if !ca_path.exists() {
                return Err(TlsError::CaCertFileNotFound(ca_file.clone()));
            }
            let reader = BufReader::new(File::open(ca_path).map_err(TlsError::CertReadError)?);
            let ca_certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TlsError::PemError(e.to_string()))?;
            for cert in ca_certs {
                root_store
                    .add(cert)
                    .map_err(|e| TlsError::VerifierError(e.to_string()))?;
            }
        }

        let verifier = if settings.require_client_certs {
            WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| TlsError::VerifierError(e.to_string()))?
        } else {
            WebPkiClientVerifier::builder(Arc::new(root_store))
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsError::VerifierError(e.to_string()))?
        };

        rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pairs_rejected() {
        let settings = TlsSettings {
            cert_key_pairs: Vec::new(),
            client_cas: Vec::new(),
            require_client_certs: false,
        };
        assert!(matches!(
            load_tls_acceptor(&settings),
            Err(TlsError::NoCertPairs)
        ));
    }

    #[test]
    fn malformed_pair_rejected() {
        let settings = TlsSettings {
            cert_key_pairs: vec!["just-one-path.pem".into()],
            client_cas: Vec::new(),
            require_client_certs: false,
        };
        assert!(matches!(
            load_tls_acceptor(&settings),
            Err(TlsError::MalformedPair(_))
        ));
    }

    #[test]
    fn missing_cert_file_rejected() {
        let settings = TlsSettings {
            cert_key_pairs: vec!["/nonexistent/cert.pem,/nonexistent/key.pem".into()],
            client_cas: Vec::new(),
            require_client_certs: false,
        };
        assert!(matches!(
            load_tls_acceptor(&settings),
            Err(TlsError::CertFileNotFound(_))
        ));
    }

    #[test]
    fn missing_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(
            &cert,
            "-----BEGIN CERTIFICATE-----\ntest\n-----END CERTIFICATE-----\n",
        )
        .unwrap();

        let settings = TlsSettings {
            cert_key_pairs: vec![format!("{},{}", cert.display(), "/nonexistent/key.pem")],
            client_cas: Vec::new(),
            require_client_certs: false,
        };
        assert!(matches!(
            load_tls_acceptor(&settings),
            Err(TlsError::KeyFileNotFound(_))
        ));
    }
}
