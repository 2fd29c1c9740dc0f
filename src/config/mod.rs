//! Server configuration and validation (C10, config half).
//!
//! Unlike the teacher's environment-variable config, an embeddable library
//! is configured in-process by its host: `ServerConfig` is built through
//! `ServerConfigBuilder` and validated once, at `build()` time, per §4.10.
//! It stays `Serialize`/`Deserialize` so a host that does want to load it
//! from a file or env layer can do so ahead of `build()`.

pub mod resolve;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// How the dispatcher treats line terminators on the wire (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrlfMode {
    /// Strip every CR/LF from incoming lines; always emit `\r\n`.
    Ensure,
    /// Accept `\r\n` or bare `\n`; record which was seen for DATA lines.
    Leave,
    /// Require exactly `\r\n`; a bare `\n` anywhere in the line is a 500.
    Strict,
}

impl Default for CrlfMode {
    fn default() -> Self {
        CrlfMode::Ensure
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    Forbidden,
    Optional,
    Required,
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::Optional
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptMode {
    TlsForbidden,
    TlsOptional,
    TlsRequired,
}

impl Default for EncryptMode {
    fn default() -> Self {
        EncryptMode::TlsOptional
    }
}

/// Fully validated server configuration. Construct via
/// [`ServerConfigBuilder`]; there is no public way to build one that skips
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub hosts: Vec<String>,
    pub ports: Vec<String>,

    pub max_connections: Option<usize>,
    pub max_processings: usize,
    pub pre_fork: usize,

    pub crlf_mode: CrlfMode,
    pub auth_mode: AuthMode,
    pub encrypt_mode: EncryptMode,
    pub pipelining_extension: bool,
    pub i18n_enabled: bool,

    pub io_buffer_chunk_size: usize,
    pub io_buffer_max_size: Option<usize>,
    pub io_cmd_timeout_secs: Option<u64>,
    pub io_data_timeout_secs: Option<u64>,

    pub do_dns_reverse_lookup: bool,

    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,

    pub wait_seconds_before_close: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hosts: vec!["127.0.0.1".to_string()],
            ports: vec!["2525".to_string()],
            max_connections: None,
            max_processings: 10,
            pre_fork: 0,
            crlf_mode: CrlfMode::default(),
            auth_mode: AuthMode::default(),
            encrypt_mode: EncryptMode::default(),
            pipelining_extension: true,
            i18n_enabled: true,
            io_buffer_chunk_size: 4096,
            io_buffer_max_size: Some(64 * 1024),
            io_cmd_timeout_secs: Some(300),
            io_data_timeout_secs: Some(600),
            do_dns_reverse_lookup: false,
            tls_cert_path: None,
            tls_key_path: None,
            wait_seconds_before_close: 30,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        if self.max_processings == 0 {
            return Err(anyhow!("max_processings must be a positive integer"));
        }
        if let Some(max_connections) = self.max_connections {
            if max_connections < self.max_processings {
                return Err(anyhow!(
                    "max_connections ({max_connections}) must be >= max_processings ({})",
                    self.max_processings
                ));
            }
        }
        if self.pre_fork != 0 && self.pre_fork < 2 {
            return Err(anyhow!("pre_fork must be 0 or >= 2"));
        }
        #[cfg(not(unix))]
        if self.pre_fork > 1 {
            return Err(anyhow!("pre_fork is only supported on unix platforms"));
        }
        if self.hosts.is_empty() || self.hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(anyhow!("hosts must be non-empty and contain no empty tokens"));
        }
        if self.ports.is_empty() || self.ports.iter().any(|p| p.trim().is_empty()) {
            return Err(anyhow!("ports must be non-empty and contain no empty tokens"));
        }
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(anyhow!(
                    "tls_cert_path and tls_key_path must be supplied together"
                ))
            }
            _ => {}
        }
        if self.encrypt_mode != EncryptMode::TlsForbidden && self.io_buffer_chunk_size == 0 {
            return Err(anyhow!("io_buffer_chunk_size must be positive"));
        }
        Ok(())
    }
}

/// Builds a [`ServerConfig`], validating once at [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct ServerConfigBuilder {
    inner: ServerConfig,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        ServerConfigBuilder {
            inner: ServerConfig::default(),
        }
    }
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.inner.$name = value;
            self
        }
    };
}

impl ServerConfigBuilder {
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inner.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    pub fn ports(mut self, ports: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inner.ports = ports.into_iter().map(Into::into).collect();
        self
    }

    setter!(max_connections, Option<usize>);
    setter!(max_processings, usize);
    setter!(pre_fork, usize);
    setter!(crlf_mode, CrlfMode);
    setter!(auth_mode, AuthMode);
    setter!(encrypt_mode, EncryptMode);
    setter!(pipelining_extension, bool);
    setter!(i18n_enabled, bool);
    setter!(io_buffer_chunk_size, usize);
    setter!(io_buffer_max_size, Option<usize>);
    setter!(io_cmd_timeout_secs, Option<u64>);
    setter!(io_data_timeout_secs, Option<u64>);
    setter!(do_dns_reverse_lookup, bool);
    setter!(wait_seconds_before_close, u64);

    pub fn tls_cert(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.inner.tls_cert_path = Some(cert_path.into());
        self.inner.tls_key_path = Some(key_path.into());
        self
    }

    pub fn build(self) -> Result<ServerConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}
