//! TLS layering for control and live sockets.
//!
//! DB/C FS servers present self-signed certificates and the stock clients
//! never check them, so the default [`TlsMode::Anonymous`] accepts any server
//! certificate. [`TlsMode::Verified`] is available for deployments that do
//! install real certificates.

use crate::error::ClientError;
use crate::stream::ClientStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// How the server certificate is treated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Accept any certificate. Encrypts but does not authenticate the server.
    #[default]
    Anonymous,
    /// Validate the certificate chain and host name against a PEM CA file,
    /// or the bundled web PKI roots when no file is given.
    Verified { ca_cert_path: Option<PathBuf> },
}

/// Cipher suites offered to the server. TLS 1.2 only.
fn allowed_cipher_suites() -> Vec<rustls::SupportedCipherSuite> {
    vec![
        aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(CryptoProvider {
        cipher_suites: allowed_cipher_suites(),
        ..aws_lc_rs::default_provider()
    })
}

/// Wraps freshly connected or reverse-connected sockets in TLS.
#[derive(Clone)]
pub struct SecureTransport {
    connector: TlsConnector,
    mode: TlsMode,
}

impl std::fmt::Debug for SecureTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureTransport")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SecureTransport {
    pub fn new(mode: &TlsMode) -> Result<Self, ClientError> {
        let config = match mode {
            TlsMode::Anonymous => anonymous_config()?,
            TlsMode::Verified { ca_cert_path } => verified_config(ca_cert_path.as_deref())?,
        };
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            mode: mode.clone(),
        })
    }

    pub fn mode(&self) -> &TlsMode {
        &self.mode
    }

    /// Runs the client side of the TLS handshake over `stream`.
    ///
    /// `host` is used as the server name; if it is not a valid DNS name or IP
    /// literal the peer address is used instead.
    pub async fn wrap(&self, stream: TcpStream, host: &str) -> Result<ClientStream, ClientError> {
        let name = server_name(host, &stream)?;
        tracing::debug!("TLS handshake with {:?}", name);
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
        tracing::debug!("TLS handshake complete");
        Ok(ClientStream::from(tls))
    }
}

fn server_name(host: &str, stream: &TcpStream) -> Result<ServerName<'static>, ClientError> {
    if let Ok(name) = ServerName::try_from(host.to_string()) {
        return Ok(name);
    }
    let peer = stream.peer_addr()?;
    Ok(ServerName::IpAddress(peer.ip().into()))
}

fn anonymous_config() -> Result<ClientConfig, ClientError> {
    let provider = provider();
    let verifier = AnyCertificate {
        schemes: provider.signature_verification_algorithms.supported_schemes(),
    };
    tracing::warn!("TLS server certificate verification is disabled");
    Ok(ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

fn verified_config(ca_cert_path: Option<&Path>) -> Result<ClientConfig, ClientError> {
    let mut roots = RootCertStore::empty();
    match ca_cert_path {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS12])
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Accepts every server certificate and signature.
#[derive(Debug)]
struct AnyCertificate {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AnyCertificate {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ClientError::TlsConfig(format!(
            "no certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}
