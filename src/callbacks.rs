//! Host callback contract (C9).
//!
//! The dispatcher and DATA reassembler never store mail, resolve recipients,
//! or decide who may authenticate — they call out to whatever `Callbacks`
//! implementation the host supplied when it built the server. Everything
//! here has a no-op default except `on_auth` (denies) and
//! `on_process_line_unknown` (500), matching §4.9.

use async_trait::async_trait;

use crate::context::SessionContext;
use crate::error::{Result, SmtpError};

/// Severity passed to `on_logging_event`, independent of the crate's
/// internal `tracing` spans — this is the host-facing hook, not our own
/// diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[async_trait]
pub trait Callbacks: Send + Sync {
    async fn on_logging_event(
        &self,
        _ctx: &SessionContext,
        _severity: LogSeverity,
        _message: &str,
        _err: Option<&SmtpError>,
    ) {
    }

    async fn on_connect(&self, _ctx: &mut SessionContext) {}

    async fn on_disconnect(&self, _ctx: &mut SessionContext) {}

    async fn on_helo(&self, _ctx: &mut SessionContext, _arg: &str) {}

    /// Verify AUTH credentials. Returning `Ok(None)` accepts with the
    /// decoded authzid; `Ok(Some(id))` accepts and overrides the
    /// authorization id; `Err` rejects (formatted as 535 unless the error
    /// already carries a different protocol code).
    async fn on_auth(
        &self,
        _ctx: &mut SessionContext,
        _authzid: &str,
        _authcid: &str,
        _secret: &str,
    ) -> Result<Option<String>> {
        Err(SmtpError::auth_failed("authentication not permitted"))
    }

    async fn on_mail_from(&self, _ctx: &mut SessionContext, arg: &str) -> Result<Option<String>> {
        let _ = arg;
        Ok(None)
    }

    async fn on_rcpt_to(&self, _ctx: &mut SessionContext, arg: &str) -> Result<Option<String>> {
        let _ = arg;
        Ok(None)
    }

    async fn on_message_data_start(&self, _ctx: &mut SessionContext) -> Result<()> {
        Ok(())
    }

    async fn on_message_data_headers(&self, _ctx: &mut SessionContext) -> Result<()> {
        Ok(())
    }

    async fn on_message_data_receiving(&self, _ctx: &mut SessionContext) -> Result<()> {
        Ok(())
    }

    async fn on_message_data(&self, _ctx: &mut SessionContext) -> Result<()> {
        Ok(())
    }

    async fn on_process_line_unknown(&self, _ctx: &mut SessionContext, line: &str) -> Result<()> {
        Err(SmtpError::syntax(format!(
            "unrecognized command: {}",
            line.trim()
        )))
    }
}

/// A `Callbacks` that accepts everything and stores nothing; useful for
/// smoke tests and as the demo binary's starting point.
pub struct NoopCallbacks;

#[async_trait]
impl Callbacks for NoopCallbacks {}
