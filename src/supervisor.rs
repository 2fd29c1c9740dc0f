//! Connection Supervisor (C7): one accept loop per bound listener, admission
//! control, and orderly shutdown.
//!
//! Grounded on the teacher's `Server::run` accept loop (spawn-per-connection,
//! log-and-continue on accept error), generalized with the two admission
//! gates the spec requires: a connection slot (a counted `HashSet`, checked
//! at accept time) and a processing slot (a `Semaphore`, awaited after the
//! greeting is sent but before the command loop starts).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result as AnyResult;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::callbacks::Callbacks;
use crate::config::ServerConfig;
use crate::process::Role;
use crate::session::{self, ConnectionInfo};
use crate::tls::TlsTransport;

struct Admission {
    connections: Mutex<HashSet<u64>>,
    max_connections: Option<usize>,
    processing: Arc<Semaphore>,
}

/// Multiplexes many SMTP sessions over a set of already-bound listeners.
/// One `Supervisor` per process (or per pre-forked worker).
pub struct Supervisor {
    cfg: Arc<ServerConfig>,
    callbacks: Arc<dyn Callbacks>,
    tls: Option<Arc<TlsTransport>>,
    admission: Arc<Admission>,
    next_id: AtomicU64,
    listen_cancel: CancellationToken,
    session_cancel: CancellationToken,
    role: Role,
}

impl Supervisor {
    pub fn new(
        cfg: Arc<ServerConfig>,
        callbacks: Arc<dyn Callbacks>,
        tls: Option<Arc<TlsTransport>>,
        role: Role,
    ) -> Self {
        let admission = Admission {
            connections: Mutex::new(HashSet::new()),
            max_connections: cfg.max_connections,
            processing: Arc::new(Semaphore::new(cfg.max_processings)),
        };
        Supervisor {
            cfg,
            callbacks,
            tls,
            admission: Arc::new(admission),
            next_id: AtomicU64::new(0),
            listen_cancel: CancellationToken::new(),
            session_cancel: CancellationToken::new(),
            role,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role.is_master()
    }

    pub fn is_worker(&self) -> bool {
        self.role.is_worker()
    }

    /// Binds every address in `std_listeners` (already resolved, handed in
    /// as blocking-mode std listeners so pre-fork can inherit the file
    /// descriptors before any Tokio runtime exists) and runs each accept
    /// loop to completion, returning once every listener has stopped.
    pub async fn serve(self: Arc<Self>, std_listeners: Vec<std::net::TcpListener>) -> AnyResult<()> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for std_listener in std_listeners {
            std_listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(std_listener)?;
            let sup = Arc::clone(&self);
            handles.push(tokio::spawn(async move { sup.accept_loop(listener).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let local_addr = listener.local_addr().ok();
        info!(?local_addr, "listening");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.listen_cancel.cancelled() => {
                    info!(?local_addr, "stop-service signal received");
                    return;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    let sup = Arc::clone(&self);
                    tokio::spawn(async move { sup.handle_connection(stream, remote_addr).await });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut connections = self.admission.connections.lock().await;
            if let Some(max) = self.admission.max_connections {
                if connections.len() >= max {
                    drop(connections);
                    reject_over_capacity(stream).await;
                    return;
                }
            }
            connections.insert(id);
        }

        let local_addr = stream.local_addr().unwrap_or_else(|_| remote_addr);
        let (local_host, remote_host) = self.resolve_names(local_addr, remote_addr).await;

        let info = ConnectionInfo {
            local_addr,
            remote_addr,
            local_host,
            remote_host,
        };

        let result = session::run_session(
            stream,
            Arc::clone(&self.cfg),
            self.tls.clone(),
            Arc::clone(&self.callbacks),
            info,
            self.session_cancel.clone(),
            Arc::clone(&self.admission.processing),
        )
        .await;

        self.admission.connections.lock().await.remove(&id);

        if let Err(e) = result {
            warn!(error = %e, "session ended with an error");
        }
    }

    async fn resolve_names(&self, local: SocketAddr, remote: SocketAddr) -> (String, String) {
        if !self.cfg.do_dns_reverse_lookup {
            return (local.ip().to_string(), remote.ip().to_string());
        }
        let local_host = reverse_lookup(local.ip()).await.unwrap_or_else(|| local.ip().to_string());
        let remote_host = reverse_lookup(remote.ip()).await.unwrap_or_else(|| remote.ip().to_string());
        (local_host, remote_host)
    }

    /// Stops accepting new connections on every listener; existing sessions
    /// are left to finish on their own.
    pub fn shutdown(&self) {
        self.listen_cancel.cancel();
    }

    /// `shutdown`, plus an optional grace period, then a forced
    /// stop-connection signal to every session still open.
    pub async fn stop(&self, wait_seconds_before_close: u64, gracefully: bool) {
        self.listen_cancel.cancel();
        if gracefully && wait_seconds_before_close > 0 {
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(wait_seconds_before_close);
            while tokio::time::Instant::now() < deadline {
                if self.admission.connections.lock().await.is_empty() {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
        self.session_cancel.cancel();
    }

    pub async fn connection_count(&self) -> usize {
        self.admission.connections.lock().await.len()
    }

    pub fn processing_available(&self) -> usize {
        self.admission.processing.available_permits()
    }
}

async fn reject_over_capacity(mut stream: TcpStream) {
    use tokio::io::AsyncWriteExt;
    let _ = stream.write_all(b"421 Too many connections, try again later\r\n").await;
    let _ = stream.shutdown().await;
}

async fn reverse_lookup(ip: std::net::IpAddr) -> Option<String> {
    use hickory_resolver::config::{ResolverConfig, ResolverOpts};
    use hickory_resolver::name_server::TokioConnectionProvider;
    use hickory_resolver::Resolver;

    let resolver = Resolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
        .with_options(ResolverOpts::default())
        .build();
    let response = resolver.reverse_lookup(ip).await.ok()?;
    response.iter().next().map(|name| name.to_string())
}
