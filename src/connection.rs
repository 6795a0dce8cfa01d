//! Shared IMAP connection and TLS helpers
//!
//! Opens the per-account stream (plain TCP or implicit TLS) and
//! authenticates it. With TLS enabled the server certificate is
//! verified either by an exact SHA-1 fingerprint pin or against a
//! configured CA bundle; a mismatch is fatal for the account and never
//! silently accepted.

use crate::auth::{TokenSource, XOAuth2Authenticator};
use crate::config::{AccountConfig, Auth, Tls};
use crate::error::{Error, Result};
use async_imap::Session;
use rustls::pki_types::ServerName;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

/// Object-safe stream bound; lets TLS and plain sessions share a type.
pub trait ImapStream:
    AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug
{
}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ImapStream for T {}

/// An authenticated IMAP session over either stream kind.
pub type ImapSession = Session<Compat<Box<dyn ImapStream>>>;

/// Open a fresh session for the account: TCP connect, optional TLS
/// handshake with certificate verification, then one of the
/// authentication strategies (LOGIN with a resolved secret, or
/// XOAUTH2 with a bearer token).
pub async fn connect(
    account: &AccountConfig,
    token_cache: Option<PathBuf>,
) -> Result<ImapSession> {
    let addr = format!("{}:{}", account.host, account.port);
    debug!("connecting to {addr}");

    let tcp = TcpStream::connect(&addr).await?;
    let stream: Box<dyn ImapStream> = match &account.tls {
        Tls::Plain => Box::new(tcp),
        mode => {
            let connector = tls_connector(mode)?;
            let server_name = ServerName::try_from(account.host.clone())
                .map_err(|e| Error::Tls(format!("invalid server name: {e}")))?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::Tls(e.to_string()))?;
            Box::new(tls_stream)
        }
    };

    let client = async_imap::Client::new(stream.compat());

    let session = match &account.auth {
        Auth::Login(secret) => {
            let password = secret.resolve().await?;
            client
                .login(&account.user, &password)
                .await
                .map_err(|(e, _)| Error::Imap(format!("login failed: {e}")))?
        }
        Auth::XOAuth2(provider) => {
            let source = TokenSource::new(provider.clone(), token_cache);
            let token = source.token().await?;
            client
                .authenticate(
                    "XOAUTH2",
                    XOAuth2Authenticator::new(account.user.as_str(), token),
                )
                .await
                .map_err(|(e, _)| Error::Imap(format!("XOAUTH2 failed: {e}")))?
        }
    };

    info!("connected to {}", account.host);
    Ok(session)
}

fn tls_connector(mode: &Tls) -> Result<TlsConnector> {
    let config = match mode {
        Tls::Fingerprint(expected) => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(
                expected,
            )))
            .with_no_client_auth(),
        Tls::CaFile(path) => {
            let roots = load_ca_file(path)?;
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        Tls::Plain => {
            return Err(Error::Tls("TLS connector requested without TLS".into()))
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_ca_file(path: &Path) -> Result<rustls::RootCertStore> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot read {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert
            .map_err(|e| Error::Tls(format!("bad certificate in {}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("cannot trust {}: {e}", path.display())))?;
    }
    if roots.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(roots)
}

/// Colon-separated uppercase SHA-1 fingerprint of a DER certificate,
/// the format `openssl x509 -fingerprint` prints.
#[must_use]
pub fn format_fingerprint(der: &[u8]) -> String {
    let digest = Sha1::digest(der);
    digest
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Certificate verifier that accepts exactly one pinned certificate,
/// identified by its SHA-1 digest.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: String,
}

impl FingerprintVerifier {
    fn new(expected: &str) -> Self {
        Self {
            expected: normalize_fingerprint(expected),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
    {
        let presented = hex::encode(Sha1::digest(end_entity.as_ref()));
        if presented == self.expected {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "certificate fingerprint mismatch: {}",
                format_fingerprint(end_entity.as_ref())
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        rustls::client::danger::HandshakeSignatureValid,
        rustls::Error,
    > {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        rustls::client::danger::HandshakeSignatureValid,
        rustls::Error,
    > {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
