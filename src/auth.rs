//! AUTH LOGIN / AUTH PLAIN sub-protocol helpers (C5).
//!
//! Credential verification itself is delegated to `Callbacks::on_auth`; this
//! module only knows how to build challenges and decode/shape the base64
//! payloads the client sends in response. RFC 4616 formally allows an empty
//! authzid (two meaningful fields), but per §9.1 decision 3 a PLAIN payload
//! that doesn't decode to exactly three NUL-delimited fields is rejected with
//! 500, not 501.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use crate::error::{Result, SmtpError};

pub const LOGIN_USERNAME_PROMPT: &str = "Username:";
pub const LOGIN_PASSWORD_PROMPT: &str = "Password:";

pub fn challenge(prompt: &str) -> String {
    format!("334 {}", B64.encode(prompt))
}

/// The two-step `AUTH PLAIN` challenge has no text after `334 `, only a
/// trailing space (spec §4.5).
pub fn empty_challenge() -> String {
    "334 ".to_string()
}

pub fn decode_b64(line: &str) -> Result<Vec<u8>> {
    B64.decode(line.trim())
        .map_err(|e| SmtpError::syntax(format!("invalid base64: {e}")))
}

pub fn decode_b64_str(line: &str) -> Result<String> {
    let bytes = decode_b64(line)?;
    String::from_utf8(bytes).map_err(|e| SmtpError::syntax(format!("invalid utf-8: {e}")))
}

/// Decoded PLAIN credentials: `authzid NUL authcid NUL password`.
pub struct PlainCredentials {
    pub authzid: String,
    pub authcid: String,
    pub password: String,
}

pub fn parse_plain(payload: &[u8]) -> Result<PlainCredentials> {
    let fields: Vec<&[u8]> = payload.split(|&b| b == 0).collect();
    if fields.len() != 3 {
        return Err(SmtpError::syntax("malformed AUTH PLAIN payload"));
    }
    let to_string = |b: &[u8]| -> Result<String> {
        String::from_utf8(b.to_vec()).map_err(|e| SmtpError::syntax(format!("invalid utf-8: {e}")))
    };
    Ok(PlainCredentials {
        authzid: to_string(fields[0])?,
        authcid: to_string(fields[1])?,
        password: to_string(fields[2])?,
    })
}

/// The `authorization_id` that ends up recorded in the context: the host
/// override if given, else the decoded authzid if non-empty, else the
/// authcid (spec §4.5, last paragraph).
pub fn resolve_authorization_id(
    override_id: Option<String>,
    authzid: &str,
    authcid: &str,
) -> String {
    match override_id {
        Some(id) => id,
        None if !authzid.is_empty() => authzid.to_string(),
        None => authcid.to_string(),
    }
}
