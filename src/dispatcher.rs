//! Command dispatcher (C4): the command-sequence state machine.
//!
//! `dispatch_line` is given one already-framed raw line and the current
//! [`CommandState`]; it owns the CRLF policy, the pipelining check, the
//! state table, and the AUTH/DATA line-continuation states that read as
//! ordinary lines rather than SMTP verbs. Only STARTTLS and QUIT need the
//! caller (the session loop) to do anything beyond "write this reply":
//! [`DispatchEffect`] carries that signal.

use crate::auth::{self, PlainCredentials};
use crate::callbacks::Callbacks;
use crate::config::{AuthMode, CrlfMode, EncryptMode};
use crate::context::{CommandState, LineEnding, SessionContext};
use crate::data;
use crate::error::{Result, SmtpError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEffect {
    None,
    StartTls,
    Quit,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub next_state: CommandState,
    pub reply: String,
    pub effect: DispatchEffect,
}

impl DispatchResult {
    fn simple(next_state: CommandState, reply: impl Into<String>) -> Self {
        DispatchResult {
            next_state,
            reply: reply.into(),
            effect: DispatchEffect::None,
        }
    }
}

/// Options the dispatcher consults; a thin slice of `ServerConfig` rather
/// than the whole thing, so callers (and tests) don't need a fully built
/// config just to exercise command handling.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub crlf_mode: CrlfMode,
    pub auth_mode: AuthMode,
    pub encrypt_mode: EncryptMode,
    pub pipelining_extension: bool,
    pub i18n_enabled: bool,
    pub tls_available: bool,
}

/// Strips/validates the line terminator per the configured CRLF policy and
/// returns the remaining content plus which terminator was observed.
pub fn apply_crlf_policy(raw: &[u8], mode: CrlfMode) -> Result<(Vec<u8>, LineEnding)> {
    match mode {
        CrlfMode::Ensure => {
            let content: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|&b| b != b'\r' && b != b'\n')
                .collect();
            Ok((content, LineEnding::Crlf))
        }
        CrlfMode::Leave => {
            if let Some(stripped) = raw.strip_suffix(b"\r\n") {
                Ok((stripped.to_vec(), LineEnding::Crlf))
            } else if let Some(stripped) = raw.strip_suffix(b"\n") {
                Ok((stripped.to_vec(), LineEnding::Lf))
            } else {
                Ok((raw.to_vec(), LineEnding::Lf))
            }
        }
        CrlfMode::Strict => {
            let content = raw
                .strip_suffix(b"\r\n")
                .ok_or_else(|| SmtpError::syntax("line must end with CRLF"))?;
            if content.contains(&b'\r') {
                return Err(SmtpError::syntax("bare CR in line"));
            }
            Ok((content.to_vec(), LineEnding::Crlf))
        }
    }
}

/// Pipelining is violated when it's disabled, a second complete line is
/// already buffered, and we're not mid-DATA (where every line is body
/// content regardless of how many arrived in one chunk).
pub fn pipelining_violation(
    pipelining_extension: bool,
    state: CommandState,
    has_buffered_line: bool,
) -> bool {
    !pipelining_extension && has_buffered_line && state != CommandState::Data
}

pub async fn dispatch_line(
    policy: &DispatchPolicy,
    state: CommandState,
    content: &[u8],
    terminator: LineEnding,
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    match state {
        CommandState::Data => dispatch_data_line(content, terminator, ctx, callbacks).await,
        CommandState::AuthPlainValues => dispatch_auth_plain_payload(content, ctx, callbacks).await,
        CommandState::AuthLoginUser => dispatch_auth_login_user(content, ctx),
        CommandState::AuthLoginPass => dispatch_auth_login_pass(content, ctx, callbacks).await,
        _ => dispatch_command(policy, state, content, ctx, callbacks).await,
    }
}

fn line_as_str(content: &[u8]) -> Result<&str> {
    std::str::from_utf8(content).map_err(|e| SmtpError::syntax(format!("invalid utf-8: {e}")))
}

async fn dispatch_command(
    policy: &DispatchPolicy,
    state: CommandState,
    content: &[u8],
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    let text = line_as_str(content)?;
    let trimmed = text.trim();
    let mut words = trimmed.split_whitespace();
    let verb = words.next().unwrap_or("").to_ascii_uppercase();
    let rest: Vec<&str> = words.collect();

    match verb.as_str() {
        "NOOP" => Ok(DispatchResult::simple(state, "250 OK")),

        "RSET" => {
            require_post_helo(state)?;
            ctx.reset_message();
            Ok(DispatchResult::simple(CommandState::Rset, "250 OK"))
        }

        "QUIT" => Ok(DispatchResult {
            next_state: CommandState::Quit,
            reply: String::new(),
            effect: DispatchEffect::Quit,
        }),

        "HELO" => {
            require_state(state, CommandState::Helo)?;
            let arg = rest.join(" ");
            ctx.server.helo = arg.clone();
            callbacks.on_helo(ctx, &arg).await;
            ctx.server.helo_response = crate::context::strip_crlf(&ctx.server.helo_response);
            Ok(DispatchResult::simple(CommandState::Rset, helo_reply(ctx)))
        }

        "EHLO" => {
            require_state(state, CommandState::Helo)?;
            let arg = rest.join(" ");
            ctx.server.helo = arg.clone();
            callbacks.on_helo(ctx, &arg).await;
            ctx.server.helo_response = crate::context::strip_crlf(&ctx.server.helo_response);
            Ok(DispatchResult::simple(
                CommandState::Rset,
                ehlo_reply(ctx, policy),
            ))
        }

        "STARTTLS" => {
            if state == CommandState::Helo {
                return Err(SmtpError::bad_sequence("send HELO/EHLO first"));
            }
            if ctx.server.encrypted.is_some() {
                return Err(SmtpError::bad_sequence("already using TLS"));
            }
            if policy.encrypt_mode == EncryptMode::TlsForbidden || !policy.tls_available {
                return Err(SmtpError::bad_sequence("TLS not available"));
            }
            Ok(DispatchResult {
                next_state: CommandState::StartTls,
                reply: "220 Ready to start TLS".to_string(),
                effect: DispatchEffect::StartTls,
            })
        }

        "AUTH" => {
            require_tls_if_required(policy, ctx)?;
            if state != CommandState::Rset {
                return Err(SmtpError::bad_sequence("AUTH not allowed here"));
            }
            if ctx.server.authenticated.is_some() {
                return Err(SmtpError::bad_sequence("already authenticated"));
            }
            if policy.auth_mode == AuthMode::Forbidden {
                return Err(SmtpError::bad_sequence("AUTH not supported"));
            }
            dispatch_auth_start(&rest, ctx, callbacks).await
        }

        "MAIL" => {
            require_post_helo(state)?;
            require_tls_if_required(policy, ctx)?;
            require_auth_if_required(policy, ctx)?;
            require_state(state, CommandState::Rset)?;
            dispatch_mail_from(policy, &rest, ctx, callbacks).await
        }

        "RCPT" => {
            require_tls_if_required(policy, ctx)?;
            require_auth_if_required(policy, ctx)?;
            if state != CommandState::Mail && state != CommandState::Rcpt {
                return Err(SmtpError::bad_sequence("need MAIL FROM first"));
            }
            dispatch_rcpt_to(&rest, ctx, callbacks).await
        }

        "DATA" => {
            require_tls_if_required(policy, ctx)?;
            require_auth_if_required(policy, ctx)?;
            require_state(state, CommandState::Rcpt)?;
            ctx.message.received = Some(std::time::SystemTime::now());
            Ok(DispatchResult::simple(
                CommandState::Data,
                "354 Enter message, ending with \".\" on a line by itself",
            ))
        }

        _ => {
            callbacks.on_process_line_unknown(ctx, text).await?;
            Ok(DispatchResult::simple(state, "250 OK"))
        }
    }
}

fn require_state(state: CommandState, expected: CommandState) -> Result<()> {
    if state != expected {
        Err(SmtpError::bad_sequence("command not allowed in this sequence"))
    } else {
        Ok(())
    }
}

fn require_post_helo(state: CommandState) -> Result<()> {
    if state == CommandState::Helo {
        Err(SmtpError::bad_sequence("send HELO/EHLO first"))
    } else {
        Ok(())
    }
}

fn require_auth_if_required(policy: &DispatchPolicy, ctx: &SessionContext) -> Result<()> {
    if policy.auth_mode == AuthMode::Required && ctx.server.authenticated.is_none() {
        Err(SmtpError::auth_required("authentication required"))
    } else {
        Ok(())
    }
}

fn require_tls_if_required(policy: &DispatchPolicy, ctx: &SessionContext) -> Result<()> {
    if policy.encrypt_mode == EncryptMode::TlsRequired && ctx.server.encrypted.is_none() {
        Err(SmtpError::tls_required("TLS required"))
    } else {
        Ok(())
    }
}

fn helo_reply(ctx: &SessionContext) -> String {
    if ctx.server.helo_response.is_empty() {
        "250 OK".to_string()
    } else {
        format!("250 OK {}", ctx.server.helo_response)
    }
}

fn ehlo_reply(ctx: &SessionContext, policy: &DispatchPolicy) -> String {
    let mut extensions = vec!["8BITMIME".to_string()];
    if policy.i18n_enabled {
        extensions.push("SMTPUTF8".to_string());
    }
    if policy.pipelining_extension {
        extensions.push("PIPELINING".to_string());
    }
    if policy.auth_mode != AuthMode::Forbidden {
        extensions.push("AUTH LOGIN PLAIN".to_string());
    }
    if policy.encrypt_mode != EncryptMode::TlsForbidden
        && policy.tls_available
        && ctx.server.encrypted.is_none()
    {
        extensions.push("STARTTLS".to_string());
    }

    let mut lines: Vec<String> = extensions.iter().map(|e| format!("250-{e}")).collect();
    lines.push("250 OK".to_string());
    lines.join("\r\n")
}

/// `MAIL FROM:<addr>[ BODY=7BIT|8BITMIME][ SMTPUTF8]`.
async fn dispatch_mail_from(
    policy: &DispatchPolicy,
    words: &[&str],
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    let (first, params) = words
        .split_first()
        .ok_or_else(|| SmtpError::syntax("MAIL FROM: missing address"))?;
    let address = strip_prefix_ci(first, "FROM:")
        .ok_or_else(|| SmtpError::syntax("expected MAIL FROM:<address>"))?;

    let mut encoding_body = String::new();
    let mut encoding_utf8 = String::new();
    for param in params {
        if let Some(body) = strip_prefix_ci(param, "BODY=") {
            let body_upper = body.to_ascii_uppercase();
            match body_upper.as_str() {
                "7BIT" | "8BITMIME" if policy.i18n_enabled => {
                    encoding_body = body_upper.to_ascii_lowercase()
                }
                _ => return Err(SmtpError::param_error(format!("unsupported BODY={body}"))),
            }
        } else if param.eq_ignore_ascii_case("SMTPUTF8") {
            if !policy.i18n_enabled {
                return Err(SmtpError::param_error("SMTPUTF8 not supported"));
            }
            encoding_utf8 = "utf8".to_string();
        } else {
            return Err(SmtpError::param_error(format!("unrecognized MAIL parameter: {param}")));
        }
    }

    let override_addr = callbacks.on_mail_from(ctx, address).await?;
    ctx.envelope.from = override_addr.unwrap_or_else(|| address.to_string());
    ctx.envelope.encoding_body = encoding_body;
    ctx.envelope.encoding_utf8 = encoding_utf8;

    Ok(DispatchResult::simple(CommandState::Mail, "250 OK"))
}

async fn dispatch_rcpt_to(
    words: &[&str],
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    let first = words
        .first()
        .ok_or_else(|| SmtpError::syntax("RCPT TO: missing address"))?;
    let address = strip_prefix_ci(first, "TO:")
        .ok_or_else(|| SmtpError::syntax("expected RCPT TO:<address>"))?;

    let override_addr = callbacks.on_rcpt_to(ctx, address).await?;
    ctx.envelope
        .to
        .push(override_addr.unwrap_or_else(|| address.to_string()));

    Ok(DispatchResult::simple(CommandState::Rcpt, "250 OK"))
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// `AUTH PLAIN`/`AUTH LOGIN`, with or without an inline initial response
/// (spec §4.5). A one-shot PLAIN or LOGIN-with-username response is
/// resolved immediately rather than deferred to a continuation line, since
/// the client has already sent everything it's going to send for that step.
async fn dispatch_auth_start(
    words: &[&str],
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    let mechanism = words
        .first()
        .ok_or_else(|| SmtpError::syntax("AUTH requires a mechanism"))?
        .to_ascii_uppercase();
    let initial_response = words.get(1).copied();

    match mechanism.as_str() {
        "PLAIN" => match initial_response {
            Some(b64) => {
                let decoded = auth::decode_b64(b64)?;
                let creds = auth::parse_plain(&decoded)?;
                finish_auth(ctx, callbacks, creds).await
            }
            None => Ok(DispatchResult::simple(
                CommandState::AuthPlainValues,
                auth::empty_challenge(),
            )),
        },
        "LOGIN" => match initial_response {
            Some(user_b64) => {
                let authcid = auth::decode_b64_str(user_b64)?;
                ctx.auth_scratch.authentication_id = authcid;
                Ok(DispatchResult {
                    next_state: CommandState::AuthLoginPass,
                    reply: auth::challenge(auth::LOGIN_PASSWORD_PROMPT),
                    effect: DispatchEffect::None,
                })
            }
            None => Ok(DispatchResult::simple(
                CommandState::AuthLoginUser,
                auth::challenge(auth::LOGIN_USERNAME_PROMPT),
            )),
        },
        other => Err(SmtpError::param_error(format!("unsupported AUTH mechanism: {other}"))),
    }
}

async fn dispatch_auth_plain_payload(
    content: &[u8],
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    let text = line_as_str(content)?;
    let decoded = auth::decode_b64(text)?;
    let creds = auth::parse_plain(&decoded)?;
    finish_auth(ctx, callbacks, creds).await
}

fn dispatch_auth_login_user(content: &[u8], ctx: &mut SessionContext) -> Result<DispatchResult> {
    let text = line_as_str(content)?;
    let authcid = auth::decode_b64_str(text)?;
    ctx.auth_scratch.authentication_id = authcid;
    Ok(DispatchResult {
        next_state: CommandState::AuthLoginPass,
        reply: auth::challenge(auth::LOGIN_PASSWORD_PROMPT),
        effect: DispatchEffect::None,
    })
}

async fn dispatch_auth_login_pass(
    content: &[u8],
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    let text = line_as_str(content)?;
    let password = auth::decode_b64_str(text)?;
    let creds = PlainCredentials {
        authzid: String::new(),
        authcid: ctx.auth_scratch.authentication_id.clone(),
        password,
    };
    finish_auth(ctx, callbacks, creds).await
}

async fn finish_auth(
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
    creds: PlainCredentials,
) -> Result<DispatchResult> {
    ctx.auth_scratch = Default::default();
    let outcome = callbacks
        .on_auth(ctx, &creds.authzid, &creds.authcid, &creds.password)
        .await;

    match outcome {
        Ok(override_id) => {
            let authorization_id =
                auth::resolve_authorization_id(override_id, &creds.authzid, &creds.authcid);
            ctx.server.authorization_id = authorization_id;
            ctx.server.authentication_id = creds.authcid;
            ctx.server.authenticated = Some(std::time::SystemTime::now());
            Ok(DispatchResult::simple(CommandState::Rset, "235 OK"))
        }
        Err(e) => {
            ctx.record_error(e.to_string());
            Ok(DispatchResult::simple(CommandState::Rset, "535 Authentication failed"))
        }
    }
}

async fn dispatch_data_line(
    content: &[u8],
    terminator: LineEnding,
    ctx: &mut SessionContext,
    callbacks: &dyn Callbacks,
) -> Result<DispatchResult> {
    if ctx.message.data.is_empty() && !ctx.message.headers {
        callbacks.on_message_data_start(ctx).await?;
    }

    if data::is_terminator(content) {
        data::finish(ctx);
        let outcome = callbacks.on_message_data(ctx).await;
        ctx.reset_message();
        return match outcome {
            Ok(()) => Ok(DispatchResult::simple(
                CommandState::Rset,
                "250 Requested mail action okay, completed",
            )),
            Err(e) => {
                let reply = e.reply_line().unwrap_or_else(|| "451 local error in processing".to_string());
                Ok(DispatchResult::simple(CommandState::Rset, reply))
            }
        };
    }

    let crossed_boundary = data::append_line(ctx, content, terminator);
    if crossed_boundary {
        callbacks.on_message_data_headers(ctx).await?;
    }
    callbacks.on_message_data_receiving(ctx).await?;

    Ok(DispatchResult::simple(CommandState::Data, String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::NoopCallbacks;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;

    fn policy() -> DispatchPolicy {
        DispatchPolicy {
            crlf_mode: CrlfMode::Ensure,
            auth_mode: AuthMode::Optional,
            encrypt_mode: EncryptMode::TlsOptional,
            pipelining_extension: true,
            i18n_enabled: true,
            tls_available: true,
        }
    }

    #[test]
    fn crlf_ensure_strips_all_cr_lf() {
        let (content, term) = apply_crlf_policy(b"HELO x\r\n", CrlfMode::Ensure).unwrap();
        assert_eq!(content, b"HELO x");
        assert_eq!(term, LineEnding::Crlf);
    }

    #[test]
    fn crlf_strict_rejects_bare_lf() {
        assert!(apply_crlf_policy(b"HELO x\n", CrlfMode::Strict).is_err());
        assert!(apply_crlf_policy(b"HELO x\r\n", CrlfMode::Strict).is_ok());
    }

    #[test]
    fn crlf_leave_records_observed_terminator() {
        let (_, term) = apply_crlf_policy(b"body\n", CrlfMode::Leave).unwrap();
        assert_eq!(term, LineEnding::Lf);
        let (_, term) = apply_crlf_policy(b"body\r\n", CrlfMode::Leave).unwrap();
        assert_eq!(term, LineEnding::Crlf);
    }

    #[tokio::test]
    async fn commands_before_helo_are_rejected_except_noop_quit() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        let p = policy();
        let result = dispatch_line(&p, CommandState::Helo, b"MAIL FROM:<a@x>", LineEnding::Crlf, &mut ctx, &cb).await;
        assert!(matches!(result, Err(SmtpError::Protocol { code: 503, .. })));

        let result = dispatch_line(&p, CommandState::Helo, b"NOOP", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(result.next_state, CommandState::Helo);
    }

    #[tokio::test]
    async fn helo_transitions_to_rset() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        let p = policy();
        let result = dispatch_line(&p, CommandState::Helo, b"HELO client.example", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(result.next_state, CommandState::Rset);
        assert_eq!(ctx.server.helo, "client.example");
    }

    #[tokio::test]
    async fn full_envelope_sequence() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        let p = policy();

        let r = dispatch_line(&p, CommandState::Helo, b"EHLO c", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::Rset);
        assert!(r.reply.ends_with("250 OK"));

        let r = dispatch_line(&p, CommandState::Rset, b"MAIL FROM:<a@x>", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::Mail);
        assert_eq!(ctx.envelope.from, "<a@x>");

        let r = dispatch_line(&p, CommandState::Mail, b"RCPT TO:<b@y>", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::Rcpt);
        assert_eq!(ctx.envelope.to, vec!["<b@y>".to_string()]);

        let r = dispatch_line(&p, CommandState::Rcpt, b"DATA", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::Data);
        assert!(r.reply.starts_with("354"));
    }

    #[tokio::test]
    async fn mail_from_rejects_unsupported_body_param() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        let mut p = policy();
        p.i18n_enabled = false;
        let result = dispatch_line(&p, CommandState::Rset, b"MAIL FROM:<a@x> BODY=8BITMIME", LineEnding::Crlf, &mut ctx, &cb).await;
        assert!(matches!(result, Err(SmtpError::Protocol { code: 501, .. })));
    }

    #[tokio::test]
    async fn ehlo_suppresses_starttls_once_encrypted() {
        let mut ctx = SessionContext::new();
        ctx.server.encrypted = Some(std::time::SystemTime::now());
        let reply = ehlo_reply(&ctx, &policy());
        assert!(!reply.contains("STARTTLS"));
    }

    #[tokio::test]
    async fn auth_plain_one_shot_resolves_immediately() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        let p = policy();
        let payload = B64.encode(b"\0alice\0pw");
        let r = dispatch_line(&p, CommandState::Rset, format!("AUTH PLAIN {payload}").as_bytes(), LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        // NoopCallbacks' on_auth always denies, but a one-shot response
        // still resolves in a single round trip rather than waiting for a
        // continuation line the client was never going to send.
        assert_eq!(r.next_state, CommandState::Rset);
        assert_eq!(r.reply, "535 Authentication failed");
    }

    #[tokio::test]
    async fn auth_plain_two_step() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        let p = policy();
        let r = dispatch_line(&p, CommandState::Rset, b"AUTH PLAIN", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::AuthPlainValues);
        assert_eq!(r.reply, "334 ");

        let payload = B64.encode(b"\0alice\0pw");
        let r = dispatch_line(&p, CommandState::AuthPlainValues, payload.as_bytes(), LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::Rset);
        assert_eq!(r.reply, "535 Authentication failed");
    }

    #[tokio::test]
    async fn auth_login_two_step() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        let p = policy();

        let r = dispatch_line(&p, CommandState::Rset, b"AUTH LOGIN", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::AuthLoginUser);
        assert_eq!(r.reply, "334 VXNlcm5hbWU6");

        let user_b64 = B64.encode(b"alice");
        let r = dispatch_line(&p, CommandState::AuthLoginUser, user_b64.as_bytes(), LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::AuthLoginPass);
        assert_eq!(r.reply, "334 UGFzc3dvcmQ6");

        let pass_b64 = B64.encode(b"pw");
        let r = dispatch_line(&p, CommandState::AuthLoginPass, pass_b64.as_bytes(), LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::Rset);
        assert_eq!(r.reply, "535 Authentication failed");
    }

    #[tokio::test]
    async fn pipelining_violation_detected() {
        assert!(pipelining_violation(false, CommandState::Rset, true));
        assert!(!pipelining_violation(true, CommandState::Rset, true));
        assert!(!pipelining_violation(false, CommandState::Data, true));
    }

    #[tokio::test]
    async fn dot_stuffing_round_trips_through_data_dispatch() {
        let mut ctx = SessionContext::new();
        let cb = NoopCallbacks;
        dispatch_line(&policy(), CommandState::Data, b"", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        dispatch_line(&policy(), CommandState::Data, b"..hello", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        let r = dispatch_line(&policy(), CommandState::Data, b".", LineEnding::Crlf, &mut ctx, &cb).await.unwrap();
        assert_eq!(r.next_state, CommandState::Rset);
        assert!(r.reply.starts_with("250"));
    }
}
