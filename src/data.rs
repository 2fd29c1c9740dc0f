//! DATA reassembler (C6).
//!
//! Accumulates the body one already-framed line at a time, removing RFC
//! 5321 §4.5.2 dot-stuffing and tracking the headers/body boundary. Grounded
//! on the line-state approach in the pack's dot-stuffer reference, inverted
//! here for the server side: the client stuffed outgoing dots, we undo it on
//! the way in.

use crate::context::{LineEnding, SessionContext};

/// A `.` by itself, stripped of its terminator, ends the body.
pub fn is_terminator(content: &[u8]) -> bool {
    content == b"."
}

/// Strips a single leading stuffed dot, if present.
pub fn destuff(content: &[u8]) -> &[u8] {
    if content.first() == Some(&b'.') {
        &content[1..]
    } else {
        content
    }
}

/// Appends one destuffed content line (no terminator) to `ctx.message.data`,
/// tracking the headers/body boundary. Returns `true` exactly once: when this
/// line is the first blank line, i.e. the headers/body boundary, so the
/// caller can fire `on_message_data_headers`.
pub fn append_line(ctx: &mut SessionContext, content: &[u8], terminator: LineEnding) -> bool {
    let stuffed = destuff(content);
    let is_boundary = !ctx.message.headers && stuffed.is_empty();

    ctx.message.data.extend_from_slice(stuffed);
    ctx.message.data.extend_from_slice(terminator.as_bytes());

    if is_boundary {
        ctx.message.headers = true;
    }
    is_boundary
}

/// Finalizes the body on the terminating `.` line: trims the trailing line
/// terminator appended after the last content line, stamps the delivered
/// time, and records the final byte size.
pub fn finish(ctx: &mut SessionContext) {
    let data = &mut ctx.message.data;
    if data.ends_with(b"\r\n") {
        data.truncate(data.len() - 2);
    } else if data.ends_with(b"\n") {
        data.truncate(data.len() - 1);
    }
    ctx.message.bytesize = data.len();
    ctx.message.delivered = Some(std::time::SystemTime::now());
}
