//! Non-blocking, line-oriented, bounded-buffer reads (C1).
//!
//! The spec's reference implementation busy-polls a non-blocking socket with
//! a 100ms sleep between attempts, re-testing an idle deadline. Under Tokio,
//! `AsyncRead::read` already parks the task on the reactor instead of
//! spinning, so the idiomatic port wraps each `read` in `tokio::time::timeout`
//! against the remaining budget until the deadline — same externally
//! observable timeout/overrun behavior, no busy loop.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Duration, Instant};

use crate::error::{Result, SmtpError};

/// What `read_line` found.
#[derive(Debug)]
pub enum Framed {
    /// A full line, including its trailing terminator (`\n`, possibly
    /// preceded by `\r`).
    Line(Vec<u8>),
    /// The peer closed the connection without sending a full line.
    Eof,
}

/// Per-session line framer. Not `Clone`: it owns the leftover-bytes buffer
/// for exactly one connection.
pub struct LineFramer {
    buf: Vec<u8>,
    chunk_size: usize,
    max_size: Option<usize>,
    cmd_timeout: Option<Duration>,
}

impl LineFramer {
    pub fn new(chunk_size: usize, max_size: Option<usize>, cmd_timeout: Option<Duration>) -> Self {
        LineFramer {
            buf: Vec::new(),
            chunk_size,
            max_size,
            cmd_timeout,
        }
    }

    /// Swaps the idle deadline applied to subsequent reads, e.g. the longer
    /// budget DATA gets relative to command lines.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.cmd_timeout = timeout;
    }

    /// A second complete line is already sitting in the buffer behind the one
    /// about to be returned — used by the dispatcher's pipelining check.
    pub fn has_buffered_line(&self) -> bool {
        self.buf.iter().position(|&b| b == b'\n').is_some()
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(line)
    }

    /// Reads and returns the next whole line, or `Eof` if the peer closed the
    /// stream before completing one. Errs with `IdleTimeout` or
    /// `BufferOverrun` per the configured limits (both optional).
    pub async fn read_line<R>(&mut self, stream: &mut R) -> Result<Framed>
    where
        R: AsyncRead + Unpin,
    {
        if let Some(line) = self.take_line() {
            return Ok(Framed::Line(line));
        }

        let deadline = self.cmd_timeout.map(|d| Instant::now() + d);
        let mut chunk = vec![0u8; self.chunk_size];

        loop {
            if let Some(max) = self.max_size {
                if self.buf.len() > max {
                    return Err(SmtpError::BufferOverrun);
                }
            }

            let n = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SmtpError::IdleTimeout);
                    }
                    match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
                        Ok(read_result) => read_result?,
                        Err(_elapsed) => return Err(SmtpError::IdleTimeout),
                    }
                }
                None => stream.read(&mut chunk).await?,
            };

            if n == 0 {
                // Whatever's left in `buf` is a partial line, not a protocol
                // line; EOF either way.
                return Ok(Framed::Eof);
            }

            self.buf.extend_from_slice(&chunk[..n]);

            if let Some(line) = self.take_line() {
                return Ok(Framed::Line(line));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn reads_a_single_line() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b"HELO foo\r\n").await.unwrap();
        let mut framer = LineFramer::new(16, None, None);
        match framer.read_line(&mut server).await.unwrap() {
            Framed::Line(line) => assert_eq!(line, b"HELO foo\r\n"),
            Framed::Eof => panic!("expected a line"),
        }
    }

    #[tokio::test]
    async fn splits_two_pipelined_lines_from_one_chunk() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b"RSET\r\nNOOP\r\n").await.unwrap();
        let mut framer = LineFramer::new(64, None, None);
        match framer.read_line(&mut server).await.unwrap() {
            Framed::Line(line) => assert_eq!(line, b"RSET\r\n"),
            Framed::Eof => panic!("expected a line"),
        }
        assert!(framer.has_buffered_line());
        match framer.read_line(&mut server).await.unwrap() {
            Framed::Line(line) => assert_eq!(line, b"NOOP\r\n"),
            Framed::Eof => panic!("expected a line"),
        }
    }

    #[tokio::test]
    async fn eof_before_any_line_is_reported() {
        let (client, mut server) = duplex(64);
        drop(client);
        let mut framer = LineFramer::new(16, None, None);
        match framer.read_line(&mut server).await.unwrap() {
            Framed::Eof => {}
            Framed::Line(_) => panic!("expected eof"),
        }
    }

    #[tokio::test]
    async fn overrun_without_newline_is_reported() {
        let (mut client, mut server) = duplex(256);
        client.write_all(&vec![b'a'; 100]).await.unwrap();
        let mut framer = LineFramer::new(16, Some(32), None);
        let result = framer.read_line(&mut server).await;
        assert!(matches!(result, Err(SmtpError::BufferOverrun)));
    }

    #[tokio::test]
    async fn idle_timeout_without_newline_is_reported() {
        let (_client, mut server) = duplex(256);
        let mut framer = LineFramer::new(16, None, Some(Duration::from_millis(20)));
        let result = framer.read_line(&mut server).await;
        assert!(matches!(result, Err(SmtpError::IdleTimeout)));
    }
}
