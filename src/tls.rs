//! TLS transport for STARTTLS (C2).
//!
//! Builds a `rustls::ServerConfig` either from a configured cert/key pair or,
//! if none is supplied, a self-signed certificate synthesized from the
//! configured hosts. `start` performs the server-side handshake and hands
//! back a stream that replaces the raw one for the rest of the session.

use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::{info, instrument};

use crate::error::{Result, SmtpError};

/// Certificate source: a configured PEM pair on disk, or self-signed,
/// synthesized from the hosts this server is bound to.
#[derive(Debug, Clone)]
pub enum CertSource {
    PemFiles { cert_path: String, key_path: String },
    SelfSigned { subject_alt_names: Vec<String> },
}

pub struct TlsTransport {
    config: Arc<ServerConfig>,
}

impl TlsTransport {
    /// Ensures a crypto provider is installed process-wide. Safe to call
    /// more than once; only the first call wins.
    fn ensure_crypto_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    pub fn new(source: CertSource) -> Result<Self> {
        Self::ensure_crypto_provider();

        let (certs, key) = match source {
            CertSource::PemFiles {
                cert_path,
                key_path,
            } => Self::load_pem_files(&cert_path, &key_path)?,
            CertSource::SelfSigned { subject_alt_names } => {
                Self::generate_self_signed(&subject_alt_names)?
            }
        };

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(SmtpError::Tls)?;

        Ok(TlsTransport {
            config: Arc::new(config),
        })
    }

    fn load_pem_files(
        cert_path: &str,
        key_path: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::parse_pem(&cert_pem, &key_pem)
    }

    /// Resolve CN per §4.2: if the first candidate host is a loopback
    /// address or the literal `localhost`, default to `localhost.local`.
    fn default_cn(hosts: &[String]) -> String {
        match hosts.first() {
            Some(h) if h == "localhost" || h == "127.0.0.1" || h == "::1" => {
                "localhost.local".to_string()
            }
            Some(h) => h.clone(),
            None => "localhost.local".to_string(),
        }
    }

    fn generate_self_signed(
        hosts: &[String],
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cn = Self::default_cn(hosts);
        let mut sans = hosts.to_vec();
        if sans.is_empty() {
            sans.push(cn.clone());
        }

        let mut params = rcgen::CertificateParams::new(sans)
            .map_err(|e| SmtpError::Unexpected(anyhow::anyhow!("rcgen params: {e}")))?;
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, cn.clone());
        params.distinguished_name = dn;

        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| SmtpError::Unexpected(anyhow::anyhow!("rcgen key: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| SmtpError::Unexpected(anyhow::anyhow!("rcgen self_signed: {e}")))?;

        info!(cn = %cn, "generated self-signed TLS certificate");

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();
        Self::parse_pem(cert_pem.as_bytes(), key_pem.as_bytes())
    }

    fn parse_pem(
        cert_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut Cursor::new(cert_pem)).collect::<std::io::Result<_>>()?;
        if certs.is_empty() {
            return Err(SmtpError::Unexpected(anyhow::anyhow!(
                "no certificates found in PEM data"
            )));
        }
        let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem))?.ok_or_else(|| {
            SmtpError::Unexpected(anyhow::anyhow!("no private key found in PEM data"))
        })?;
        Ok((certs, key))
    }

    /// Performs the server-side TLS handshake, replacing the raw stream.
    #[instrument(skip(self, stream))]
    pub async fn start<S>(&self, stream: S) -> Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let acceptor = TlsAcceptor::from(self.config.clone());
        let tls_stream = acceptor.accept(stream).await?;
        Ok(tls_stream)
    }
}
