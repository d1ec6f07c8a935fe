//! Authenticated request execution under a concurrency limit.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    auth::{AccessToken, AttemptId, TokenAuthState},
    error::{TransportError, TransportResult},
    metrics::SessionMetrics,
    retry::{Retrier, RetryPolicy},
    transport::{Request, Response, Transport},
};

/// Default number of concurrent transport calls.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;

/// One of the executor's concurrency slots, released on drop.
#[derive(Debug)]
pub struct InFlightRequestSlot {
    _permit: OwnedSemaphorePermit,
}

/// Executes authenticated requests with at most `limit` in flight.
///
/// Each submission holds a slot for its whole lifetime: token acquisition,
/// every retry, and the single re-execution after a rejected token. The
/// token refresh is not a transport call of the executor and is shared by
/// all submissions waiting on it.
pub struct ConcurrencyLimitedExecutor<T: Transport> {
    transport: Arc<T>,
    auth: TokenAuthState,
    slots: Arc<Semaphore>,
    limit: usize,
    retrier: Retrier,
    metrics: SessionMetrics,
}

impl<T: Transport> ConcurrencyLimitedExecutor<T> {
    /// Create an executor with the default limit and retry policy.
    pub fn new(transport: Arc<T>, auth: TokenAuthState) -> Self {
        let metrics = auth.metrics().clone();
        Self {
            transport,
            auth,
            slots: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY_LIMIT)),
            limit: DEFAULT_CONCURRENCY_LIMIT,
            retrier: Retrier::default(),
            metrics,
        }
    }

    /// Set the number of concurrent transport calls (at least 1).
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        let limit = limit.max(1);
        self.slots = Arc::new(Semaphore::new(limit));
        self.limit = limit;
        self
    }

    /// Set the retry policy applied to every transport call.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retrier = Retrier::new(policy);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots not currently held.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn auth(&self) -> &TokenAuthState {
        &self.auth
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Stop admitting submissions. Queued and later calls fail with
    /// `Canceled`; submissions already holding a slot run to completion.
    pub fn shutdown(&self) {
        tracing::info!("Executor shutting down");
        self.slots.close();
    }

    /// Submit a request and return its 2xx response.
    ///
    /// A 401 triggers one token refresh and one re-execution. Other non-2xx
    /// statuses are returned as the matching [`TransportError`].
    pub async fn submit(&self, request: Request) -> TransportResult<Response> {
        self.metrics.record_request();
        let request_id = request.id;

        let result = self.execute(request).await;
        if let Err(err) = &result {
            tracing::debug!(%request_id, error = %err, "Request failed");
            self.metrics.record_failure(failure_kind(err));
        }
        result
    }

    /// Submit a request and decode the 2xx body as JSON.
    pub async fn submit_json<R: DeserializeOwned>(&self, request: Request) -> TransportResult<R> {
        self.submit(request).await?.json()
    }

    async fn acquire_slot(&self) -> TransportResult<InFlightRequestSlot> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Canceled)?;
        Ok(InFlightRequestSlot { _permit: permit })
    }

    async fn execute(&self, request: Request) -> TransportResult<Response> {
        let _slot = self.acquire_slot().await?;
        let attempt = AttemptId::new();

        let token = self.auth.ensure_authenticated(attempt).await?;
        let response = self.send(&request, &token).await?;
        if response.status != 401 {
            return classify(response);
        }

        tracing::info!(request_id = %request.id, "Token rejected, re-executing after refresh");
        self.auth.report_unauthorized(&token, attempt);
        let token = self.auth.ensure_authenticated(attempt).await?;
        let response = self.send(&request, &token).await?;
        if response.status == 401 {
            return Err(TransportError::unauthorized(
                "access token rejected after refresh",
            ));
        }
        classify(response)
    }

    async fn send(&self, request: &Request, token: &AccessToken) -> TransportResult<Response> {
        let header_value = token.header_value();
        self.retrier
            .run(|| {
                let request = request.clone().bearer(header_value.clone());
                self.transport.send(request)
            })
            .await
    }
}

impl<T: Transport> Clone for ConcurrencyLimitedExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            auth: self.auth.clone(),
            slots: Arc::clone(&self.slots),
            limit: self.limit,
            retrier: self.retrier.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Transport> std::fmt::Debug for ConcurrencyLimitedExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimitedExecutor")
            .field("limit", &self.limit)
            .field("available_slots", &self.available_slots())
            .field("auth", &self.auth)
            .finish()
    }
}

fn classify(response: Response) -> TransportResult<Response> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(TransportError::from_status(response.status))
    }
}

fn failure_kind(err: &TransportError) -> &'static str {
    match err {
        TransportError::NoConnection { .. } => "no_connection",
        TransportError::Unauthorized { .. } => "unauthorized",
        TransportError::TokenExpired => "token_expired",
        TransportError::RetriableHttp { .. } => "retriable_http",
        TransportError::NonRetriableHttp { .. } => "non_retriable_http",
        TransportError::NonHttpResponse => "non_http_response",
        TransportError::Decoding { .. } => "decoding",
        TransportError::Canceled => "canceled",
        TransportError::Config { .. } => "config",
        TransportError::Internal { .. } => "internal",
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::Deserialize;

    use super::*;
    use crate::{
        auth::CredentialSource,
        error::RefreshError,
        transport::{Method, StreamConnection},
    };

    struct StoredToken;

    #[async_trait]
    impl CredentialSource for StoredToken {
        async fn access_token(&self) -> Option<AccessToken> {
            Some(AccessToken::new("stored"))
        }

        async fn refresh_tokens(&self) -> Result<Option<AccessToken>, RefreshError> {
            Err(RefreshError::Expired)
        }
    }

    /// Answers every request with a fixed status and echoes the auth header.
    struct FixedStatus(u16);

    #[async_trait]
    impl Transport for FixedStatus {
        async fn send(&self, request: Request) -> TransportResult<Response> {
            let auth = request.headers.get("authorization").cloned().unwrap_or_default();
            let body = serde_json::json!({ "auth": auth, "path": request.path });
            Ok(Response::new(request.id, self.0, body.to_string()))
        }

        async fn open_stream(&self, _request: Request) -> TransportResult<StreamConnection> {
            Err(TransportError::internal("not streaming"))
        }
    }

    fn executor(status: u16) -> ConcurrencyLimitedExecutor<FixedStatus> {
        let auth = TokenAuthState::new(Arc::new(StoredToken));
        ConcurrencyLimitedExecutor::new(Arc::new(FixedStatus(status)), auth)
            .with_retry_policy(RetryPolicy::none())
    }

    #[derive(Deserialize)]
    struct Echo {
        auth: String,
        path: String,
    }

    #[tokio::test]
    async fn test_submit_attaches_bearer_token() {
        let executor = executor(200);
        let echo: Echo = executor
            .submit_json(Request::new(Method::Get, "/me"))
            .await
            .unwrap();
        assert_eq!(echo.auth, "Bearer stored");
        assert_eq!(echo.path, "/me");
        assert_eq!(executor.metrics().request_count(), 1);
        assert_eq!(executor.metrics().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_non_success_status_is_classified() {
        let err = executor(404).submit(Request::get("/missing")).await.unwrap_err();
        assert_eq!(err, TransportError::NonRetriableHttp { status: 404 });

        let err = executor(503).submit(Request::get("/busy")).await.unwrap_err();
        assert_eq!(err, TransportError::RetriableHttp { status: 503 });
    }

    #[tokio::test]
    async fn test_rejected_token_with_expired_refresh_is_unauthorized() {
        let executor = executor(401);
        let err = executor.submit(Request::get("/me")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { .. }));
        assert_eq!(executor.metrics().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_submissions() {
        let executor = executor(200).with_limit(2);
        assert_eq!(executor.available_slots(), 2);

        executor.shutdown();
        let err = executor.submit(Request::get("/me")).await.unwrap_err();
        assert_eq!(err, TransportError::Canceled);
    }
}
