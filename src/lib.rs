//! An embeddable SMTP submission server: a per-connection session engine
//! (HELO/AUTH/STARTTLS/DATA) driven by host-supplied callbacks.
//!
//! The host builds a [`config::ServerConfig`], implements [`callbacks::Callbacks`]
//! for whatever it wants to do with accepted mail, and calls [`Server::run`].
//! Everything else — framing, CRLF policy, the AUTH and STARTTLS sub-dialogs,
//! dot-stuffing, admission control, optional pre-fork — is handled
//! internally.

pub mod auth;
pub mod callbacks;
pub mod config;
pub mod context;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod framer;
pub mod process;
pub mod session;
pub mod supervisor;
pub mod tls;

pub use callbacks::Callbacks;
pub use config::{AuthMode, CrlfMode, EncryptMode, ServerConfig, ServerConfigBuilder};
pub use error::{Result, SmtpError};

use std::sync::Arc;

use anyhow::Context as _;
use tls::{CertSource, TlsTransport};

/// Top-level handle a host builds once and runs. Owns no I/O until
/// [`run`](Self::run) is called: binding and (optionally) pre-forking both
/// happen at that point, not at construction.
pub struct Server {
    cfg: ServerConfig,
    callbacks: Arc<dyn Callbacks>,
}

impl Server {
    pub fn new(cfg: ServerConfig, callbacks: Arc<dyn Callbacks>) -> Self {
        Server { cfg, callbacks }
    }

    /// Builds the TLS transport (if TLS isn't forbidden), binds every
    /// configured address, optionally pre-forks, and runs until the
    /// process receives an interrupt. This is a blocking call: it starts
    /// its own Tokio runtime(s) internally, per C8's requirement that
    /// forking happen before any async runtime exists.
    pub fn run(self) -> anyhow::Result<()> {
        let tls = self.build_tls_transport()?;
        process::ProcessSupervisor::run(self.cfg, self.callbacks, tls)
    }

    fn build_tls_transport(&self) -> anyhow::Result<Option<Arc<TlsTransport>>> {
        if self.cfg.encrypt_mode == config::EncryptMode::TlsForbidden {
            return Ok(None);
        }
        let source = match (&self.cfg.tls_cert_path, &self.cfg.tls_key_path) {
            (Some(cert), Some(key)) => CertSource::PemFiles {
                cert_path: cert.clone(),
                key_path: key.clone(),
            },
            _ => CertSource::SelfSigned {
                subject_alt_names: self.cfg.hosts.clone(),
            },
        };
        let transport = TlsTransport::new(source).context("failed to initialize TLS transport")?;
        Ok(Some(Arc::new(transport)))
    }
}

/// Installs a reasonable default `tracing` subscriber (env-filter driven,
/// defaulting to `info`). Host programs are free to set up their own
/// subscriber instead; this is a convenience for the demo binary and for
/// hosts that don't already have one.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
