//! Black-box tests driving a real `Supervisor` over loopback TCP. Each test
//! binds an ephemeral port, spawns the accept loop, and talks SMTP to it
//! exactly as a client would, covering the scenarios and invariants that
//! only show up once the whole stack is wired together (framer + dispatcher
//! + supervisor admission), as opposed to the dispatcher unit tests that
//! drive individual lines directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use smtpd_core::callbacks::{Callbacks, NoopCallbacks};
use smtpd_core::config::{AuthMode, ServerConfig};
use smtpd_core::context::SessionContext;
use smtpd_core::error::{Result, SmtpError};
use smtpd_core::process::Role;
use smtpd_core::supervisor::Supervisor;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct Delivered {
    from: String,
    to: Vec<String>,
    data: Vec<u8>,
}

impl std::fmt::Debug for Delivered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivered")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

/// Records every delivered message and accepts a single "alice"/"secret"
/// credential, so tests can assert on envelope contents after the fact.
struct RecordingCallbacks {
    delivered: Mutex<Vec<Delivered>>,
}

impl RecordingCallbacks {
    fn new() -> Arc<Self> {
        Arc::new(RecordingCallbacks {
            delivered: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Callbacks for RecordingCallbacks {
    async fn on_auth(
        &self,
        _ctx: &mut SessionContext,
        _authzid: &str,
        authcid: &str,
        secret: &str,
    ) -> Result<Option<String>> {
        if authcid == "alice" && secret == "secret" {
            Ok(None)
        } else {
            Err(SmtpError::auth_failed("bad credentials"))
        }
    }

    async fn on_message_data(&self, ctx: &mut SessionContext) -> Result<()> {
        self.delivered.lock().unwrap().push(Delivered {
            from: ctx.envelope.from.clone(),
            to: ctx.envelope.to.clone(),
            data: ctx.message.data.clone(),
        });
        Ok(())
    }
}

async fn start_server(cfg: ServerConfig, callbacks: Arc<dyn Callbacks>) -> std::net::SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let addr = std_listener.local_addr().unwrap();
    let sup = Arc::new(Supervisor::new(Arc::new(cfg), callbacks, None, Role::Worker));
    tokio::spawn(async move {
        let _ = sup.serve(vec![std_listener]).await;
    });
    addr
}

struct Client {
    write: tokio::net::tcp::OwnedWriteHalf,
    read: BufReader<tokio::net::tcp::OwnedReadHalf>,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = timeout(DEADLINE, TcpStream::connect(addr)).await.unwrap().unwrap();
        let (read, write) = stream.into_split();
        Client {
            write,
            read: BufReader::new(read),
        }
    }

    async fn send(&mut self, line: &str) {
        timeout(DEADLINE, self.write.write_all(format!("{line}\r\n").as_bytes()))
            .await
            .unwrap()
            .unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        timeout(DEADLINE, self.write.write_all(bytes)).await.unwrap().unwrap();
    }

    async fn read_reply(&mut self) -> String {
        use tokio::io::AsyncBufReadExt;
        let mut full = String::new();
        loop {
            let mut line = String::new();
            timeout(DEADLINE, self.read.read_line(&mut line))
                .await
                .unwrap()
                .unwrap();
            let is_last = line.len() < 4 || line.as_bytes()[3] != b'-';
            full.push_str(&line);
            if is_last {
                break;
            }
        }
        full
    }
}

#[tokio::test]
async fn s1_plain_delivery_round_trip() {
    let cb = RecordingCallbacks::new();
    let cfg = ServerConfig::builder().auth_mode(AuthMode::Optional).build().unwrap();
    let addr = start_server(cfg, cb.clone()).await;

    let mut client = Client::connect(addr).await;
    assert!(client.read_reply().await.starts_with("220"));

    client.send("EHLO c").await;
    assert!(client.read_reply().await.contains("250"));

    client.send("MAIL FROM:<a@x>").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("RCPT TO:<b@y>").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("DATA").await;
    assert!(client.read_reply().await.starts_with("354"));

    client.send_raw(b"Subject: hi\r\n\r\nbody\r\n.\r\n").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("QUIT").await;
    assert!(client.read_reply().await.starts_with("221"));

    let delivered = cb.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].from, "<a@x>");
    assert_eq!(delivered[0].to, vec!["<b@y>".to_string()]);
    assert_eq!(delivered[0].data, b"Subject: hi\r\n\r\nbody");
    assert_eq!(delivered[0].data.len(), 19);
}

#[tokio::test]
async fn s2_unknown_command_then_rset_keeps_session_alive() {
    let cfg = ServerConfig::builder().build().unwrap();
    let addr = start_server(cfg, Arc::new(NoopCallbacks)).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;

    client.send("EHLO c").await;
    client.read_reply().await;

    client.send("FOO").await;
    assert!(client.read_reply().await.starts_with("500"));

    client.send("RSET").await;
    assert!(client.read_reply().await.starts_with("250"));

    client.send("QUIT").await;
    assert!(client.read_reply().await.starts_with("221"));
}

#[tokio::test]
async fn s3_auth_plain_one_shot_then_mail_from() {
    let cb = RecordingCallbacks::new();
    let cfg = ServerConfig::builder().auth_mode(AuthMode::Optional).build().unwrap();
    let addr = start_server(cfg, cb).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;

    client.send("EHLO c").await;
    client.read_reply().await;

    let payload = B64.encode(b"\0alice\0secret");
    client.send(&format!("AUTH PLAIN {payload}")).await;
    assert!(client.read_reply().await.starts_with("235"));

    client.send("MAIL FROM:<alice@x>").await;
    assert!(client.read_reply().await.starts_with("250"));
}

#[tokio::test]
async fn s4_auth_login_two_step() {
    let cb = RecordingCallbacks::new();
    let cfg = ServerConfig::builder().auth_mode(AuthMode::Optional).build().unwrap();
    let addr = start_server(cfg, cb).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;

    client.send("EHLO c").await;
    client.read_reply().await;

    client.send("AUTH LOGIN").await;
    let reply = client.read_reply().await;
    assert!(reply.starts_with("334 VXNlcm5hbWU6"));

    client.send(&B64.encode(b"alice")).await;
    let reply = client.read_reply().await;
    assert!(reply.starts_with("334 UGFzc3dvcmQ6"));

    client.send(&B64.encode(b"secret")).await;
    assert!(client.read_reply().await.starts_with("235"));
}

#[tokio::test]
async fn s6_dot_stuffing_round_trip() {
    let cb = RecordingCallbacks::new();
    let cfg = ServerConfig::builder().build().unwrap();
    let addr = start_server(cfg, cb.clone()).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;

    client.send("EHLO c").await;
    client.read_reply().await;
    client.send("MAIL FROM:<a@x>").await;
    client.read_reply().await;
    client.send("RCPT TO:<b@y>").await;
    client.read_reply().await;
    client.send("DATA").await;
    client.read_reply().await;

    client.send_raw(b"..hello\r\n.\r\n").await;
    assert!(client.read_reply().await.starts_with("250"));

    let delivered = cb.delivered.lock().unwrap();
    assert_eq!(delivered[0].data, b".hello");
}

#[tokio::test]
async fn invariant1_sequencing_violations_yield_503() {
    let cfg = ServerConfig::builder().build().unwrap();
    let addr = start_server(cfg, Arc::new(NoopCallbacks)).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;

    client.send("MAIL FROM:<a@x>").await;
    assert!(client.read_reply().await.starts_with("503"));

    client.send("RCPT TO:<b@y>").await;
    assert!(client.read_reply().await.starts_with("503"));

    client.send("DATA").await;
    assert!(client.read_reply().await.starts_with("503"));
}

#[tokio::test]
async fn invariant3_auth_required_gates_mail() {
    let cfg = ServerConfig::builder().auth_mode(AuthMode::Required).build().unwrap();
    let addr = start_server(cfg, Arc::new(NoopCallbacks)).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.send("EHLO c").await;
    client.read_reply().await;

    client.send("MAIL FROM:<a@x>").await;
    assert!(client.read_reply().await.starts_with("530"));
}

#[tokio::test]
async fn invariant6_pipelining_disabled_rejects_second_buffered_command() {
    let cfg = ServerConfig::builder().pipelining_extension(false).build().unwrap();
    let addr = start_server(cfg, Arc::new(NoopCallbacks)).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.send("EHLO c").await;
    client.read_reply().await;

    client.send_raw(b"RSET\r\nNOOP\r\n").await;
    assert!(client.read_reply().await.starts_with("250"));
    assert!(client.read_reply().await.starts_with("500"));
}

#[tokio::test]
async fn invariant9_idle_timeout_yields_421() {
    let cfg = ServerConfig::builder().io_cmd_timeout_secs(Some(1)).build().unwrap();
    let addr = start_server(cfg, Arc::new(NoopCallbacks)).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;
    client.send("EHLO c").await;
    client.read_reply().await;

    // Send nothing and wait past the configured idle timeout.
    assert!(client.read_reply().await.starts_with("421"));
}

#[tokio::test]
async fn invariant10_buffer_overrun_yields_500() {
    let cfg = ServerConfig::builder()
        .io_buffer_chunk_size(8)
        .io_buffer_max_size(Some(16))
        .build()
        .unwrap();
    let addr = start_server(cfg, Arc::new(NoopCallbacks)).await;
    let mut client = Client::connect(addr).await;
    client.read_reply().await;

    // A line with no terminator longer than io_buffer_max_size.
    client.send_raw(&vec![b'a'; 64]).await;
    assert!(client.read_reply().await.starts_with("500"));
}

#[tokio::test]
async fn invariant8_connection_cap_rejects_with_421() {
    let cfg = ServerConfig::builder()
        .max_connections(Some(1))
        .max_processings(1)
        .build()
        .unwrap();
    let addr = start_server(cfg, Arc::new(NoopCallbacks)).await;

    let mut first = Client::connect(addr).await;
    assert!(first.read_reply().await.starts_with("220"));

    // Give the supervisor a moment to register the first connection before
    // the second arrives, since registration happens in the spawned task.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = Client::connect(addr).await;
    let reply = second.read_reply().await;
    assert!(reply.starts_with("421"));

    first.send("QUIT").await;
    let _ = first.read_reply().await;
}

#[tokio::test]
async fn invariant12_concurrent_sessions_do_not_cross_contaminate() {
    let cb = RecordingCallbacks::new();
    let cfg = ServerConfig::builder().max_processings(4).build().unwrap();
    let addr = start_server(cfg, cb.clone()).await;

    let mut handles = Vec::new();
    for i in 0..4 {
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client.read_reply().await;
            client.send("EHLO c").await;
            client.read_reply().await;
            let addr = format!("<user{i}@example.com>");
            client.send(&format!("MAIL FROM:{addr}")).await;
            client.read_reply().await;
            client.send(&format!("RCPT TO:{addr}")).await;
            client.read_reply().await;
            client.send("DATA").await;
            client.read_reply().await;
            client.send_raw(b"hi\r\n.\r\n").await;
            client.read_reply().await;
            client.send("QUIT").await;
            client.read_reply().await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let delivered = cb.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 4);
    let mut seen = HashMap::new();
    for d in delivered.iter() {
        assert_eq!(d.from, d.to[0], "envelope cross-contaminated: {d:?}");
        *seen.entry(d.from.clone()).or_insert(0) += 1;
    }
    assert_eq!(seen.len(), 4);
}
