//! Session client example
//!
//! Executes one authenticated request and then follows the update stream,
//! printing every batch of operations until Ctrl-C.
//!
//! Run with:
//! `API_BASE_URL=https://api.example.com API_TOKEN=... cargo run -p hpx-session --example session_client`

use std::{env, sync::Arc, time::Duration};

use async_trait::async_trait;
use hpx_session::{
    AccessToken, ConcurrencyLimitedExecutor, CredentialSource, HttpConfig, HttpTransport,
    RefreshError, RemoteUpdate, Request, StreamingConfig, StreamingService, TokenAuthState,
};
use tracing_subscriber::EnvFilter;

/// Reads the token from the environment. A real client would call its
/// token endpoint in `refresh_tokens`.
struct EnvCredentials;

#[async_trait]
impl CredentialSource for EnvCredentials {
    async fn access_token(&self) -> Option<AccessToken> {
        env::var("API_TOKEN").ok().map(AccessToken::new)
    }

    async fn refresh_tokens(&self) -> Result<Option<AccessToken>, RefreshError> {
        Ok(env::var("API_TOKEN").ok().map(AccessToken::new))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base_url =
        env::var("API_BASE_URL").unwrap_or_else(|_| "https://api.example.com".to_string());
    let config = HttpConfig::builder(base_url)
        .timeout(Duration::from_secs(30))
        .build()?;
    let transport = Arc::new(HttpTransport::new(config)?);
    let auth = TokenAuthState::new(Arc::new(EnvCredentials));

    let executor = ConcurrencyLimitedExecutor::new(Arc::clone(&transport), auth.clone());
    match executor.submit(Request::get("/v1/me")).await {
        Ok(response) => tracing::info!(status = response.status, "Fetched profile"),
        Err(err) => tracing::warn!(error = %err, "Profile request failed"),
    }

    let service = StreamingService::new(
        transport,
        auth,
        StreamingConfig::new("/v1/events").reconnect_delay(Duration::from_secs(5)),
    )?;
    let mut updates = service.subscribe();
    service.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.next_update() => {
                let Some(RemoteUpdate::NewOperationsAvailable(ops)) = update else {
                    break;
                };
                println!("{} new operations", ops.len());
            }
        }
    }

    service.stop();
    if let Some(err) = service.last_error() {
        tracing::error!(error = %err, "Stream ended");
    }
    tracing::info!(
        connections = service.metrics().connection_count(),
        reconnects = service.metrics().reconnect_count(),
        "Done"
    );
    Ok(())
}
