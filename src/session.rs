//! Per-connection session engine: wires the framer, TLS transport, context,
//! and dispatcher into the command loop a `Connection Supervisor` worker
//! task runs to completion (C3+C4 orchestration).
//!
//! The STARTTLS stream swap uses the pack's "replace the enum variant"
//! pattern rather than a trait object, so the concrete `AsyncRead`/
//! `AsyncWrite` impl is known at compile time on both sides of the upgrade.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Semaphore;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::callbacks::{Callbacks, LogSeverity};
use crate::config::ServerConfig;
use crate::context::{CommandState, SessionContext};
use crate::dispatcher::{self, DispatchEffect, DispatchPolicy};
use crate::error::{Result, SmtpError};
use crate::framer::{Framed, LineFramer};
use crate::tls::TlsTransport;

/// Either the raw accepted stream, or the same stream wrapped in TLS after
/// a successful STARTTLS. Not generic over a trait object: both arms are
/// concrete, so reads/writes after the upgrade cost nothing extra.
enum SessionStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    /// Transient placeholder occupying `stream` for the instant between
    /// taking the pre-upgrade inner value and installing the TLS one.
    /// Never polled: nothing awaits on `stream` during that window.
    Upgrading,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SessionStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            SessionStream::Upgrading => unreachable!("stream polled mid-STARTTLS upgrade"),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SessionStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            SessionStream::Upgrading => unreachable!("stream polled mid-STARTTLS upgrade"),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            SessionStream::Upgrading => unreachable!("stream polled mid-STARTTLS upgrade"),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SessionStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SessionStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            SessionStream::Upgrading => unreachable!("stream polled mid-STARTTLS upgrade"),
        }
    }
}

/// Addressing facts the supervisor already resolved at accept time, handed
/// in so the session never has to touch the listener or socket options
/// itself.
pub struct ConnectionInfo {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub local_host: String,
    pub remote_host: String,
}

fn dispatch_policy(cfg: &ServerConfig, tls_available: bool) -> DispatchPolicy {
    DispatchPolicy {
        crlf_mode: cfg.crlf_mode,
        auth_mode: cfg.auth_mode,
        encrypt_mode: cfg.encrypt_mode,
        pipelining_extension: cfg.pipelining_extension,
        i18n_enabled: cfg.i18n_enabled,
        tls_available,
    }
}

/// Runs one client's full command/response dialog to completion. Returns
/// `Ok(())` for every orderly end (QUIT, EOF, idle timeout, cancellation);
/// errors are reserved for I/O failures the caller should log but cannot
/// recover from (the stream is already unusable by the time one surfaces).
#[instrument(skip_all, fields(session = %Uuid::new_v4(), remote = %info.remote_addr))]
pub async fn run_session<S>(
    stream: S,
    cfg: Arc<ServerConfig>,
    tls: Option<Arc<TlsTransport>>,
    callbacks: Arc<dyn Callbacks>,
    info: ConnectionInfo,
    cancel: CancellationToken,
    processing: Arc<Semaphore>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = SessionStream::Plain(stream);
    let mut ctx = SessionContext::new();
    ctx.connection_initialize(
        info.local_host.clone(),
        info.local_addr.ip().to_string(),
        info.local_addr.port(),
        info.remote_host.clone(),
        info.remote_addr.ip().to_string(),
        info.remote_addr.port(),
    );

    let cmd_timeout = cfg.io_cmd_timeout_secs.map(std::time::Duration::from_secs);
    let mut framer = LineFramer::new(cfg.io_buffer_chunk_size, cfg.io_buffer_max_size, cmd_timeout);
    let mut state = CommandState::Helo;
    let policy = dispatch_policy(&cfg, tls.is_some());

    callbacks.on_connect(&mut ctx).await;
    ctx.server.local_response = crate::context::strip_crlf(&ctx.server.local_response);
    let greeting = if ctx.server.local_response.is_empty() {
        format!("220 {}", ctx.server.local_host)
    } else {
        format!("220 {}", ctx.server.local_response)
    };
    if let Err(e) = write_reply(&mut stream, &greeting).await {
        callbacks.on_disconnect(&mut ctx).await;
        return Err(e);
    }

    // Admission into the processing pool happens after the greeting is on
    // the wire, not before: a client that's merely waiting for a free slot
    // still sees a live connection, not a silent hang.
    let _permit = match processing.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            callbacks.on_disconnect(&mut ctx).await;
            return Ok(());
        }
    };

    let outcome = session_loop(
        &mut stream,
        &mut framer,
        &mut state,
        &mut ctx,
        &policy,
        &cfg,
        &tls,
        callbacks.as_ref(),
        &cancel,
    )
    .await;

    callbacks.on_disconnect(&mut ctx).await;

    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => {
            debug!(error = %e, "session ended");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_loop<S>(
    stream: &mut SessionStream<S>,
    framer: &mut LineFramer,
    state: &mut CommandState,
    ctx: &mut SessionContext,
    policy: &DispatchPolicy,
    cfg: &ServerConfig,
    tls: &Option<Arc<TlsTransport>>,
    callbacks: &dyn Callbacks,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let framed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("stop-connection signal received");
                return Ok(());
            }
            framed = framer.read_line(stream) => match framed {
                Ok(framed) => framed,
                Err(e) => {
                    ctx.record_error(e.to_string());
                    if let Some(reply) = e.reply_line() {
                        write_reply(stream, &reply).await?;
                    }
                    return if e.is_fatal() { Ok(()) } else { Err(e) };
                }
            },
        };

        let raw = match framed {
            Framed::Eof => return Ok(()),
            Framed::Line(raw) => raw,
        };

        if dispatcher::pipelining_violation(
            policy.pipelining_extension,
            *state,
            framer.has_buffered_line(),
        ) {
            write_reply(stream, "500 pipelining not permitted").await?;
            continue;
        }

        let (content, terminator) = match dispatcher::apply_crlf_policy(&raw, policy.crlf_mode) {
            Ok(pair) => pair,
            Err(e) => {
                ctx.record_error(e.to_string());
                write_reply(stream, &e.reply_line().unwrap_or_default()).await?;
                continue;
            }
        };

        let result = dispatcher::dispatch_line(policy, *state, &content, terminator, ctx, callbacks).await;

        let dispatched = match result {
            Ok(d) => d,
            Err(e) => {
                ctx.record_error(e.to_string());
                callbacks
                    .on_logging_event(ctx, LogSeverity::Warn, "command rejected", Some(&e))
                    .await;
                if let Some(reply) = e.reply_line() {
                    write_reply(stream, &reply).await?;
                }
                if e.is_fatal() {
                    return Err(e);
                }
                continue;
            }
        };

        let entering_data = dispatched.next_state == CommandState::Data && *state != CommandState::Data;
        let leaving_data = *state == CommandState::Data && dispatched.next_state != CommandState::Data;
        *state = dispatched.next_state;
        if !dispatched.reply.is_empty() {
            write_reply(stream, &dispatched.reply).await?;
        }

        if entering_data {
            framer.set_timeout(cfg.io_data_timeout_secs.map(std::time::Duration::from_secs));
        } else if leaving_data {
            framer.set_timeout(cfg.io_cmd_timeout_secs.map(std::time::Duration::from_secs));
        }

        match dispatched.effect {
            DispatchEffect::None => {}
            DispatchEffect::Quit => {
                write_reply(stream, "221 Bye").await?;
                return Ok(());
            }
            DispatchEffect::StartTls => {
                let transport = tls
                    .as_ref()
                    .ok_or_else(|| SmtpError::bad_sequence("TLS not configured"))?;
                upgrade_to_tls(stream, transport, ctx, cfg).await?;
                *framer = LineFramer::new(
                    cfg.io_buffer_chunk_size,
                    cfg.io_buffer_max_size,
                    cfg.io_cmd_timeout_secs.map(std::time::Duration::from_secs),
                );
                *state = CommandState::Helo;
            }
        }
    }
}

/// Swaps the raw stream for a TLS one in place via `mem::replace` through
/// the transient `Upgrading` variant.
async fn upgrade_to_tls<S>(
    stream: &mut SessionStream<S>,
    transport: &TlsTransport,
    ctx: &mut SessionContext,
    cfg: &ServerConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let inner = match std::mem::replace(stream, SessionStream::Upgrading) {
        SessionStream::Plain(s) => s,
        _ => return Err(SmtpError::bad_sequence("already using TLS")),
    };

    let handshake_timeout = cfg
        .io_cmd_timeout_secs
        .map(std::time::Duration::from_secs)
        .unwrap_or(std::time::Duration::from_secs(30));

    let tls_stream = tokio::time::timeout(handshake_timeout, transport.start(inner))
        .await
        .map_err(|_| SmtpError::IdleTimeout)??;

    *stream = SessionStream::Tls(Box::new(tls_stream));
    ctx.server.encrypted = Some(std::time::SystemTime::now());
    ctx.server.helo.clear();
    Ok(())
}

async fn write_reply<S>(stream: &mut SessionStream<S>, reply: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(reply.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}
