//! Auto-reconnecting Server-Sent Events update stream.
//!
//! This module turns a long-lived `data: <json>\n\n` stream into typed
//! [`RemoteUpdate`]s:
//!
//! - **Frame reassembly**: [`ChunkCollector`] rebuilds messages that the
//!   network split at arbitrary byte boundaries.
//! - **Typed events**: [`EventParser`] decodes each message into a
//!   [`SessionEvent`]; undecodable messages are dropped, not fatal.
//! - **One attempt per session**: [`StreamingSession`] owns a single
//!   connection and decides on the response before reading the body.
//! - **Reconnect loop**: [`StreamingService`] keeps a session alive with
//!   auth-aware connects and configurable backoff, and republishes updates to
//!   [`Subscription`] holders.
//!
//! # Architecture
//!
//! ```text
//! Transport::open_stream ─► StreamConnection
//!                              │ head ─► StreamingSession::start (allow / deny)
//!                              │ bytes ─► ChunkCollector ─► EventParser ─► SessionEvents
//!                                                                          │
//! StreamingService ◄───────────────────────────────────────────────────────┘
//!   └─ RemoteUpdate ─► Subscription / HandlerSubscription
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hpx_session::{
//!     auth::TokenAuthState,
//!     http::{HttpConfig, HttpTransport},
//!     sse::{StreamingConfig, StreamingService},
//! };
//!
//! # async fn example(auth: TokenAuthState) -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::new(HttpConfig::builder("https://api.example.com").build()?)?;
//! let service = StreamingService::new(
//!     Arc::new(transport),
//!     auth,
//!     StreamingConfig::new("/v1/events"),
//! )?;
//!
//! let mut updates = service.subscribe();
//! service.start();
//!
//! while let Some(update) = updates.next_update().await {
//!     println!("{update:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod collector;
mod config;
mod event;
mod observer;
mod service;
mod session;
mod subscription;

pub use collector::{ChunkCollector, ChunkResult};
pub use config::StreamingConfig;
pub use event::{EventParser, Operation, RemoteUpdate, ServerError, SessionEvent};
pub use observer::{NoopObserver, StreamObserver};
pub use service::StreamingService;
pub use session::{FinishReason, SessionEvents, SessionStateKind, StreamingSession};
pub use subscription::{HandlerSubscription, Subscription};
