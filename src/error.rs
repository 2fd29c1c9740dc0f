//! The session error taxonomy.
//!
//! `SmtpError` carries the tagged `{code, message}` data a reply is formatted
//! from. It is never used to model shutdown: cancellation is a
//! `CancellationToken`, not a `Result::Err`.

use thiserror::Error;

/// A single SMTP session error.
///
/// `ProtocolError` carries the numeric reply code a violation maps to.
/// `TransportAbort` and friends exist so the session loop can distinguish
/// "the peer hung up" (DEBUG, no farewell) from "something broke" (ERROR, a
/// best-effort reply).
#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("{code} {message}")]
    Protocol { code: u16, message: String },

    #[error("connection closed by peer")]
    TransportAbort,

    #[error("idle timeout")]
    IdleTimeout,

    #[error("command buffer overrun")]
    BufferOverrun,

    #[error("unexpected error: {0}")]
    Unexpected(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Tls(#[from] rustls::Error),
}

impl SmtpError {
    pub fn protocol(code: u16, message: impl Into<String>) -> Self {
        SmtpError::Protocol {
            code,
            message: message.into(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::protocol(500, message)
    }

    pub fn param_error(message: impl Into<String>) -> Self {
        Self::protocol(501, message)
    }

    pub fn bad_sequence(message: impl Into<String>) -> Self {
        Self::protocol(503, message)
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::protocol(530, message)
    }

    pub fn tls_required(message: impl Into<String>) -> Self {
        Self::protocol(530, format!("{} (tls)", message.into()))
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::protocol(535, message)
    }

    pub fn action_aborted(message: impl Into<String>) -> Self {
        Self::protocol(451, message)
    }

    /// The numeric reply code this error should surface as, if any.
    ///
    /// `TransportAbort` and `IdleTimeout`/`BufferOverrun` map outside the
    /// `Protocol` variant because their handling (logging level, whether a
    /// reply is even attempted) differs from a garden-variety protocol error.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            SmtpError::Protocol { code, .. } => Some(*code),
            SmtpError::IdleTimeout => Some(421),
            SmtpError::BufferOverrun => Some(500),
            SmtpError::TransportAbort => None,
            SmtpError::Unexpected(_) => Some(500),
            SmtpError::Io(_) => None,
            SmtpError::Tls(_) => None,
        }
    }

    pub fn reply_line(&self) -> Option<String> {
        match self {
            SmtpError::Protocol { code, message } => Some(format!("{code} {message}")),
            SmtpError::IdleTimeout => Some("421 Idle timeout, closing connection".to_string()),
            SmtpError::BufferOverrun => Some("500 Line too long".to_string()),
            SmtpError::Unexpected(e) => Some(format!("500 {e}")),
            _ => None,
        }
    }

    /// Whether this error should terminate the session after the reply is sent.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmtpError::IdleTimeout | SmtpError::BufferOverrun | SmtpError::TransportAbort
        ) || matches!(self, SmtpError::Protocol { code: 421, .. })
    }
}

pub type Result<T> = std::result::Result<T, SmtpError>;
