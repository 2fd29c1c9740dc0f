//! Minimal host program: accepts mail for anyone, authenticates a single
//! hardcoded user, and logs each delivered message instead of storing it.
//! Demonstrates embeddability — everything below `main` is ordinary use of
//! the public `smtpd_core` API, not internal crate code.

use std::sync::Arc;

use async_trait::async_trait;
use smtpd_core::{
    callbacks::Callbacks, context::SessionContext, error::SmtpError, AuthMode, EncryptMode,
    Result, Server, ServerConfig,
};
use tracing::info;

struct DemoCallbacks;

#[async_trait]
impl Callbacks for DemoCallbacks {
    async fn on_connect(&self, ctx: &mut SessionContext) {
        info!(remote = %ctx.server.remote_ip, "connection accepted");
    }

    async fn on_auth(
        &self,
        _ctx: &mut SessionContext,
        _authzid: &str,
        authcid: &str,
        secret: &str,
    ) -> Result<Option<String>> {
        if authcid == "demo" && secret == "demo" {
            Ok(None)
        } else {
            Err(SmtpError::auth_failed("invalid credentials"))
        }
    }

    async fn on_message_data(&self, ctx: &mut SessionContext) -> Result<()> {
        info!(
            from = %ctx.envelope.from,
            to = ?ctx.envelope.to,
            bytes = ctx.message.bytesize,
            "message accepted"
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    smtpd_core::init_tracing();

    let cfg = ServerConfig::builder()
        .hosts(["127.0.0.1"])
        .ports(["2525"])
        .auth_mode(AuthMode::Optional)
        .encrypt_mode(EncryptMode::TlsOptional)
        .build()?;

    let server = Server::new(cfg, Arc::new(DemoCallbacks));
    server.run()
}
