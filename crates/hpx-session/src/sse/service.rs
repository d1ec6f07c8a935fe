//! Auto-reconnecting update stream.
//!
//! ```text
//! StreamingService::start()
//!   └─ spawns ──► reconnect loop
//!                   ├─ no session?      sleep(idle_poll_interval), re-check
//!                   ├─ connect (bearer, one refresh on 401)
//!                   │    ├─ ok:         on_connect, publish updates, on_disconnect
//!                   │    │              (closed with no events: sleep(backoff))
//!                   │    ├─ retriable:  sleep(backoff), loop
//!                   │    └─ terminal:   exit loop
//!                   └─ loop
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    config::StreamingConfig,
    event::{RemoteUpdate, SessionEvent},
    observer::{NoopObserver, StreamObserver},
    session::{FinishReason, SessionEvents, StreamingSession},
    subscription::{HandlerSubscription, SubscriberList, Subscription},
};
use crate::{
    auth::{AccessToken, AttemptId, TokenAuthState},
    error::{TransportError, TransportResult},
    metrics::SessionMetrics,
    reconnect::ReconnectSchedule,
    transport::Transport,
};

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ServiceInner<T: Transport> {
    transport: Arc<T>,
    auth: TokenAuthState,
    config: StreamingConfig,
    observer: Arc<dyn StreamObserver>,
    subscribers: Arc<SubscriberList>,
    metrics: SessionMetrics,
    last_error: Mutex<Option<TransportError>>,
}

/// Keeps one streaming session alive and republishes its updates.
///
/// Cloning shares the service.
pub struct StreamingService<T: Transport> {
    inner: Arc<ServiceInner<T>>,
    running: Arc<Mutex<Option<RunningLoop>>>,
}

impl<T: Transport> StreamingService<T> {
    /// Create a stopped service.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid.
    pub fn new(
        transport: Arc<T>,
        auth: TokenAuthState,
        config: StreamingConfig,
    ) -> TransportResult<Self> {
        Self::with_observer(transport, auth, config, Arc::new(NoopObserver))
    }

    /// Create a stopped service that reports connections to `observer`.
    pub fn with_observer(
        transport: Arc<T>,
        auth: TokenAuthState,
        config: StreamingConfig,
        observer: Arc<dyn StreamObserver>,
    ) -> TransportResult<Self> {
        config.validate().map_err(TransportError::config)?;
        let metrics = auth.metrics().clone();
        let subscribers = Arc::new(SubscriberList::new(config.subscriber_capacity));
        Ok(Self {
            inner: Arc::new(ServiceInner {
                transport,
                auth,
                config,
                observer,
                subscribers,
                metrics,
                last_error: Mutex::new(None),
            }),
            running: Arc::new(Mutex::new(None)),
        })
    }

    /// Start the reconnect loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        *self.inner.last_error.lock() = None;
        let cancel = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Streaming service stopped");
                }
                err = inner.run() => {
                    tracing::error!(error = %err, "Streaming service terminated");
                    *inner.last_error.lock() = Some(err);
                }
            }
        });

        *running = Some(RunningLoop { cancel, task });
    }

    /// Stop the loop and the active session. Idempotent.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// The error that ended the loop, if it ended on its own.
    pub fn last_error(&self) -> Option<TransportError> {
        self.inner.last_error.lock().clone()
    }

    /// Receive updates as a stream.
    pub fn subscribe(&self) -> Subscription {
        self.inner.subscribers.subscribe()
    }

    /// Call `handler` for every update until the returned handle is released.
    pub fn subscribe_with<F>(&self, handler: F) -> HandlerSubscription
    where
        F: FnMut(RemoteUpdate) + Send + 'static,
    {
        self.inner.subscribers.subscribe_with(handler)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.inner.metrics
    }
}

impl<T: Transport> Clone for StreamingService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            running: Arc::clone(&self.running),
        }
    }
}

impl<T: Transport> std::fmt::Debug for StreamingService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingService")
            .field("path", &self.inner.config.path)
            .field("running", &self.is_running())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T: Transport> ServiceInner<T> {
    /// Run until a terminal error. Cancellation drops this future, which
    /// drops and thereby stops the active session.
    async fn run(&self) -> TransportError {
        let mut schedule = ReconnectSchedule::new(self.config.backoff());

        loop {
            if !self.auth.has_session().await {
                tracing::debug!("No signed-in session, waiting");
                tokio::time::sleep(self.config.idle_poll_interval).await;
                continue;
            }

            let failure = match self.connect().await {
                Ok((session, events)) => {
                    self.observer.on_connect();
                    let delivered = self.forward(events).await;
                    self.observer.on_disconnect();

                    // Only a connection that carried events counts as healthy.
                    if delivered > 0 {
                        schedule.reset();
                    }

                    match session.finish_reason() {
                        Some(FinishReason::Failed(err)) => err,
                        _ if delivered > 0 => {
                            tracing::debug!("Stream closed, reconnecting");
                            continue;
                        }
                        _ => {
                            let delay = schedule.next_delay();
                            self.metrics.record_reconnect();
                            tracing::warn!(
                                delay_ms = delay.as_millis() as u64,
                                "Stream closed without events, reconnecting"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                }
                Err(err) => err,
            };

            match failure {
                TransportError::NoConnection { .. }
                | TransportError::RetriableHttp { .. }
                | TransportError::TokenExpired
                | TransportError::Decoding { .. }
                | TransportError::Internal { .. } => {
                    let delay = schedule.next_delay();
                    self.metrics.record_reconnect();
                    tracing::warn!(
                        error = %failure,
                        delay_ms = delay.as_millis() as u64,
                        "Stream failed, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
                TransportError::NonRetriableHttp { .. }
                | TransportError::NonHttpResponse
                | TransportError::Unauthorized { .. }
                | TransportError::Canceled
                | TransportError::Config { .. } => return failure,
            }
        }
    }

    /// Open a session, refreshing the token once if it is rejected.
    async fn connect(&self) -> TransportResult<(StreamingSession<T>, SessionEvents)> {
        let attempt = AttemptId::new();
        let token = self.auth.ensure_authenticated(attempt).await?;

        match self.open(&token).await {
            Err(TransportError::TokenExpired) => {
                tracing::info!("Stream token rejected, refreshing");
                self.auth.report_unauthorized(&token, attempt);
                let token = self.auth.ensure_authenticated(attempt).await?;
                self.open(&token).await
            }
            other => other,
        }
    }

    async fn open(
        &self,
        token: &AccessToken,
    ) -> TransportResult<(StreamingSession<T>, SessionEvents)> {
        let request = self.config.request().bearer(token.header_value());
        let session = StreamingSession::new(
            Arc::clone(&self.transport),
            request,
            &self.config,
            self.metrics.clone(),
        );
        let events = session.start().await?;
        Ok((session, events))
    }

    /// Republish updates until the session ends. Returns the number of
    /// events received.
    async fn forward(&self, mut events: SessionEvents) -> usize {
        let mut delivered = 0;
        while let Some(event) = events.next_event().await {
            delivered += 1;
            match event {
                SessionEvent::Update(update) => self.subscribers.publish(&update),
                SessionEvent::Connected => tracing::debug!("Server confirmed connection"),
                SessionEvent::Disconnected => tracing::debug!("Server announced disconnect"),
                SessionEvent::Error(error) => tracing::warn!(
                    code = ?error.code,
                    message = %error.message,
                    "Server reported stream error"
                ),
            }
        }
        delivered
    }
}
