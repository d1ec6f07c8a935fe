//! # hpx-session
//!
//! Resilient, authenticated network access for API clients.
//!
//! This crate executes bearer-authenticated HTTP requests and keeps a
//! long-lived Server-Sent Events stream alive, refreshing credentials and
//! retrying transient failures on the caller's behalf.
//!
//! ## Features
//!
//! - **Single-flight token refresh**: however many requests find the token
//!   missing or rejected, one refresh runs and all of them wait on it
//! - **Bounded concurrency**: at most `limit` transport calls in flight
//! - **Retry policies**: status and error signals with fixed or exponential
//!   backoff
//! - **Reconnecting streams**: frame reassembly, typed events, auth-aware
//!   reconnects and explicit subscription handles
//! - **One error type**: a closed [`TransportError`] enum matched
//!   exhaustively
//! - **Observability**: structured `tracing` logs and OpenTelemetry counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use hpx_session::{
//!     ConcurrencyLimitedExecutor, Request, TokenAuthState,
//!     auth::{AccessToken, CredentialSource},
//!     error::RefreshError,
//!     http::{HttpConfig, HttpTransport},
//! };
//!
//! struct Keychain;
//!
//! #[async_trait]
//! impl CredentialSource for Keychain {
//!     async fn access_token(&self) -> Option<AccessToken> {
//!         None
//!     }
//!
//!     async fn refresh_tokens(&self) -> Result<Option<AccessToken>, RefreshError> {
//!         Ok(Some(AccessToken::new("token")))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HttpConfig::builder("https://api.example.com")
//!         .timeout(std::time::Duration::from_secs(30))
//!         .build()?;
//!
//!     let transport = Arc::new(HttpTransport::new(config)?);
//!     let auth = TokenAuthState::new(Arc::new(Keychain));
//!     let executor = ConcurrencyLimitedExecutor::new(transport, auth);
//!
//!     let response = executor.submit(Request::get("/v1/me")).await?;
//!     println!("{}", response.text()?);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod error;
pub mod executor;
pub mod metrics;
#[cfg(feature = "sse")]
mod reconnect;
pub mod retry;
pub mod transport;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "sse")]
pub mod sse;

// Re-export commonly used types
pub use auth::{AccessToken, AttemptId, AuthStatus, CredentialSource, TokenAuthState};
pub use error::{RefreshError, TransportError, TransportResult};
pub use executor::{ConcurrencyLimitedExecutor, InFlightRequestSlot};
#[cfg(feature = "http")]
pub use http::{HttpConfig, HttpTransport};
pub use metrics::SessionMetrics;
pub use retry::{Backoff, Retrier, RetryPolicy, RetrySignal};
#[cfg(feature = "sse")]
pub use sse::{RemoteUpdate, StreamingConfig, StreamingService, Subscription};
pub use transport::{Method, Request, Response, Transport};
