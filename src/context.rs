//! Per-connection session state (C3).
//!
//! `SessionContext` is a plain record, never shared across sessions: each
//! connection task owns one, passes it by `&mut` through the dispatcher, and
//! drops it at disconnect. The command-sequence token lives alongside it on
//! `Session` (src/session.rs), not inside the context itself, mirroring the
//! spec's "attached to the session, not the context" distinction.

use std::time::SystemTime;

/// The explicit state machine token (spec §3 "Command-sequence token").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Helo,
    Rset,
    Mail,
    Rcpt,
    Data,
    Quit,
    StartTls,
    AuthPlainValues,
    AuthLoginUser,
    AuthLoginPass,
}

/// CRLF line-ending observed on the wire for a single DATA line, tracked only
/// while `CommandState::Data` is active (spec §9.1 decision 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    #[default]
    Crlf,
    Lf,
}

impl LineEnding {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            LineEnding::Crlf => b"\r\n",
            LineEnding::Lf => b"\n",
        }
    }
}

/// *server* group: connection/transport level facts about this session.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub local_host: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub helo: String,
    pub local_response: String,
    pub helo_response: String,
    pub connected: Option<SystemTime>,
    pub authorization_id: String,
    pub authentication_id: String,
    pub authenticated: Option<SystemTime>,
    pub encrypted: Option<SystemTime>,
    pub exceptions: u64,
    pub errors: Vec<String>,
}

/// *envelope* group: MAIL FROM + RCPT TO, distinct from message headers.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    pub encoding_body: String,
    pub encoding_utf8: String,
}

/// *message* group: the DATA accumulator.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub received: Option<SystemTime>,
    pub delivered: Option<SystemTime>,
    pub bytesize: usize,
    pub headers: bool,
    pub crlf: LineEnding,
    pub data: Vec<u8>,
}

/// Scratch held between AUTH LOGIN's two challenge/response round trips.
/// Cleared on completion or reset (spec §3 "Auth challenge scratch").
#[derive(Debug, Clone, Default)]
pub struct AuthScratch {
    pub authorization_id: String,
    pub authentication_id: String,
}

/// One per live connection. Never cloned across tasks, never referenced from
/// more than one session task at a time.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub server: ServerInfo,
    pub envelope: Envelope,
    pub message: Message,
    pub auth_scratch: AuthScratch,
}

/// Strips CR/LF from a host-callback-supplied response string (spec §4.9):
/// `on_connect`/`on_helo` may set `local_response`/`helo_response` to
/// anything, and neither may inject extra reply lines into the wire protocol.
pub fn strip_crlf(s: &str) -> String {
    s.chars().filter(|&c| c != '\r' && c != '\n').collect()
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// *connection_initialize*: rebuilds the server group with empty strings
    /// and zero counters. Called once, right after accept.
    pub fn connection_initialize(
        &mut self,
        local_host: String,
        local_ip: String,
        local_port: u16,
        remote_host: String,
        remote_ip: String,
        remote_port: u16,
    ) {
        self.server = ServerInfo {
            local_host,
            local_ip,
            local_port,
            remote_host,
            remote_ip,
            remote_port,
            connected: Some(SystemTime::now()),
            ..Default::default()
        };
        self.envelope = Envelope::default();
        self.message = Message::default();
        self.auth_scratch = AuthScratch::default();
    }

    /// *per-message*: clears envelope and message. Caller is responsible for
    /// transitioning the command-sequence token to `CommandState::Rset`.
    pub fn reset_message(&mut self) {
        self.envelope = Envelope::default();
        self.message = Message::default();
        self.auth_scratch = AuthScratch::default();
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.server.exceptions += 1;
        self.server.errors.push(message.into());
    }
}
