//! Process Supervisor (C8): optional pre-fork of N worker processes.
//!
//! Forking has to happen before the Tokio runtime starts — forking a
//! multi-threaded async runtime is unsound, since only the forking thread
//! survives into the child. So `ProcessSupervisor::run` binds every listener
//! as a blocking `std::net::TcpListener` first, forks while still
//! single-threaded, and only then does each process (the lone standalone
//! process, or each pre-forked child) build its own Tokio runtime and hand
//! the inherited listener fds to a [`Supervisor`].
//!
//! Restricted to `cfg(unix)`: `ServerConfig::build` already rejects
//! `pre_fork > 1` on other platforms.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::callbacks::Callbacks;
use crate::config::{resolve, ServerConfig};
use crate::supervisor::Supervisor;
use crate::tls::TlsTransport;

/// Which role this OS process is playing. A standalone (non-pre-forked)
/// process is also a "worker" — it just has no siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

impl Role {
    pub fn is_master(self) -> bool {
        matches!(self, Role::Master)
    }

    pub fn is_worker(self) -> bool {
        matches!(self, Role::Worker)
    }
}

pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Resolves and binds every configured address, then either runs the
    /// server directly (`pre_fork == 0`) or forks `pre_fork` workers that
    /// each run it against the same inherited listeners. Blocks until every
    /// worker (or the lone in-process server) exits.
    pub fn run(
        cfg: ServerConfig,
        callbacks: Arc<dyn Callbacks>,
        tls: Option<Arc<TlsTransport>>,
    ) -> Result<()> {
        let std_listeners = bind_std_listeners(&cfg)?;

        if cfg.pre_fork > 1 {
            #[cfg(unix)]
            return run_prefork(cfg, callbacks, tls, std_listeners);
            #[cfg(not(unix))]
            unreachable!("ServerConfig::build rejects pre_fork > 1 on non-unix targets");
        }

        run_worker(Role::Worker, cfg, callbacks, tls, std_listeners)
    }
}

fn bind_std_listeners(cfg: &ServerConfig) -> Result<Vec<std::net::TcpListener>> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start resolver runtime")?;
    let addrs = rt.block_on(resolve::resolve_bind_addresses(&cfg.hosts, &cfg.ports))?;

    addrs
        .into_iter()
        .map(|addr| {
            std::net::TcpListener::bind(addr)
                .with_context(|| format!("failed to bind {addr}"))
        })
        .collect()
}

fn run_worker(
    role: Role,
    cfg: ServerConfig,
    callbacks: Arc<dyn Callbacks>,
    tls: Option<Arc<TlsTransport>>,
    std_listeners: Vec<std::net::TcpListener>,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start server runtime")?;

    let cfg = Arc::new(cfg);
    let supervisor = Arc::new(Supervisor::new(cfg, callbacks, tls, role));

    rt.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        tokio::select! {
            result = supervisor.clone().serve(std_listeners) => result,
            _ = &mut ctrl_c => {
                info!("received interrupt, shutting down");
                supervisor.stop(0, false).await;
                Ok(())
            }
        }
    })
}

#[cfg(unix)]
fn run_prefork(
    cfg: ServerConfig,
    callbacks: Arc<dyn Callbacks>,
    tls: Option<Arc<TlsTransport>>,
    std_listeners: Vec<std::net::TcpListener>,
) -> Result<()> {
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};

    let master = Role::Master;
    info!(pid = std::process::id(), pre_fork = cfg.pre_fork, master = master.is_master(), "master started");
    let mut children = Vec::with_capacity(cfg.pre_fork);

    for worker_index in 0..cfg.pre_fork {
        // SAFETY: called before any additional threads exist in this
        // process; the listener fds are plain kernel sockets, safe to
        // share across the fork.
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Parent { child } => {
                children.push(child);
            }
            ForkResult::Child => {
                let role = Role::Worker;
                info!(worker_index, pid = std::process::id(), "worker started");
                let listeners = std_listeners
                    .iter()
                    .map(|l| l.try_clone())
                    .collect::<std::io::Result<Vec<_>>>()
                    .context("failed to clone listener for worker")?;
                let result = run_worker(role, cfg.clone(), callbacks.clone(), tls.clone(), listeners);
                std::process::exit(if result.is_ok() { 0 } else { 1 });
            }
        }
    }

    // Master never accepts; it only joins.
    drop(std_listeners);
    for child in children {
        waitpid(child, None).context("waitpid failed")?;
    }
    Ok(())
}

/// Sends `SIGTERM` to every child pid this master spawned. Intended to be
/// called from the master's own signal handler in response to the
/// operator's own `stop`; there is no cross-process equivalent of
/// [`Supervisor::stop`] once the fork has happened.
#[cfg(unix)]
pub fn terminate_children(pids: &[nix::unistd::Pid]) {
    use nix::sys::signal::{kill, Signal};
    for pid in pids {
        let _ = kill(*pid, Signal::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_std_listeners_rejects_bad_host() {
        let cfg = ServerConfig {
            hosts: vec!["".to_string()],
            ..ServerConfig::default()
        };
        assert!(bind_std_listeners(&cfg).is_err());
    }
}
