//! Access-token state machine with single-flight refresh.
//!
//! [`TokenAuthState`] owns the one [`AccessToken`] of a credential scope.
//! Callers never store the token beyond one request attempt; they ask for it
//! with [`TokenAuthState::ensure_authenticated`] and report a server-side
//! rejection with [`TokenAuthState::report_unauthorized`].
//!
//! However many callers find the token missing at the same time, at most one
//! refresh runs: the first caller moves the state to `Refreshing` and spawns
//! the refresh task, every other caller awaits a shared handle to that same
//! task and re-reads the state once it settles.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    error::{RefreshError, TransportError, TransportResult},
    metrics::SessionMetrics,
};

/// A caller awaits at most this many refresh tasks per `ensure_authenticated`.
const MAX_REFRESH_ROUNDS: u32 = 2;

/// Opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `Authorization` header.
    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Identifies one logical caller request across refresh rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable credential store consulted by [`TokenAuthState`].
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    /// A token that is already available locally. Must not hit the network.
    async fn access_token(&self) -> Option<AccessToken>;

    /// Exchange the refresh credential for a new access token.
    async fn refresh_tokens(&self) -> Result<Option<AccessToken>, RefreshError>;

    /// Whether a signed-in session exists at all.
    async fn has_session(&self) -> bool {
        true
    }
}

/// Payload-free view of the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unknown,
    Refreshing,
    Authenticated,
    RefreshFailed,
    Unauthorized,
}

type RefreshTask = Shared<BoxFuture<'static, ()>>;

enum AuthState {
    Unknown,
    Refreshing {
        generation: u64,
        task: RefreshTask,
    },
    Authenticated(AccessToken),
    RefreshFailed {
        attempt: AttemptId,
        error: TransportError,
    },
    Unauthorized {
        reason: String,
    },
}

impl AuthState {
    fn status(&self) -> AuthStatus {
        match self {
            Self::Unknown => AuthStatus::Unknown,
            Self::Refreshing { .. } => AuthStatus::Refreshing,
            Self::Authenticated(_) => AuthStatus::Authenticated,
            Self::RefreshFailed { .. } => AuthStatus::RefreshFailed,
            Self::Unauthorized { .. } => AuthStatus::Unauthorized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    /// Try the locally stored token before refreshing.
    CachedFirst,
    /// Always refresh over the network.
    Full,
}

struct Inner {
    source: Arc<dyn CredentialSource>,
    state: Mutex<AuthState>,
    generation: AtomicU64,
    metrics: SessionMetrics,
}

impl Inner {
    async fn acquire(&self, mode: RefreshMode) -> Result<Option<AccessToken>, RefreshError> {
        if mode == RefreshMode::CachedFirst
            && let Some(token) = self.source.access_token().await
        {
            tracing::debug!("Using stored access token");
            return Ok(Some(token));
        }

        self.metrics.record_refresh();
        tracing::debug!("Refreshing access token");
        self.source.refresh_tokens().await
    }

    /// Apply a refresh outcome, unless a newer refresh has replaced it.
    fn settle(
        &self,
        generation: u64,
        attempt: AttemptId,
        outcome: Result<Option<AccessToken>, RefreshError>,
    ) {
        let mut state = self.state.lock();
        match &*state {
            AuthState::Refreshing { generation: g, .. } if *g == generation => {}
            _ => return,
        }

        *state = match outcome {
            Ok(Some(token)) => {
                tracing::info!(%attempt, "Access token refreshed");
                AuthState::Authenticated(token)
            }
            Ok(None) => {
                tracing::error!(%attempt, "Refresh returned no token, session ended");
                AuthState::Unauthorized {
                    reason: "no access token issued".to_string(),
                }
            }
            Err(RefreshError::Expired) => {
                tracing::error!(%attempt, "Refresh credentials expired, session ended");
                AuthState::Unauthorized {
                    reason: RefreshError::Expired.to_string(),
                }
            }
            Err(RefreshError::NoConnection) => {
                tracing::warn!(%attempt, "Token refresh failed: no connection");
                AuthState::RefreshFailed {
                    attempt,
                    error: TransportError::no_connection("token refresh unreachable"),
                }
            }
            Err(RefreshError::Internal(message)) => {
                tracing::warn!(%attempt, error = %message, "Token refresh failed");
                AuthState::RefreshFailed {
                    attempt,
                    error: TransportError::internal(message),
                }
            }
        };
    }
}

/// Single-flight token state for one credential scope.
///
/// Cloning shares the state.
#[derive(Clone)]
pub struct TokenAuthState {
    inner: Arc<Inner>,
}

impl TokenAuthState {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self::with_metrics(source, SessionMetrics::new())
    }

    pub fn with_metrics(source: Arc<dyn CredentialSource>, metrics: SessionMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                state: Mutex::new(AuthState::Unknown),
                generation: AtomicU64::new(0),
                metrics,
            }),
        }
    }

    /// The token if currently authenticated, as a header value.
    pub fn current_header_value(&self) -> Option<String> {
        match &*self.inner.state.lock() {
            AuthState::Authenticated(token) => Some(token.header_value()),
            _ => None,
        }
    }

    pub fn status(&self) -> AuthStatus {
        self.inner.state.lock().status()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.inner.metrics
    }

    /// Whether the credential source reports a signed-in session.
    pub async fn has_session(&self) -> bool {
        self.inner.source.has_session().await
    }

    /// Return a usable token, refreshing at most once system-wide.
    ///
    /// A `RefreshFailed` left by this caller's own attempt is returned as the
    /// error. One left by another caller triggers one more refresh.
    /// `Unauthorized` is terminal.
    pub async fn ensure_authenticated(&self, attempt: AttemptId) -> TransportResult<AccessToken> {
        let mut rounds = 0;
        loop {
            let task = {
                let mut state = self.inner.state.lock();
                match &*state {
                    AuthState::Authenticated(token) => return Ok(token.clone()),
                    AuthState::Unauthorized { reason } => {
                        return Err(TransportError::unauthorized(reason.clone()));
                    }
                    AuthState::Refreshing { task, .. } => task.clone(),
                    AuthState::Unknown => {
                        self.begin_refresh(&mut state, attempt, RefreshMode::CachedFirst)
                    }
                    AuthState::RefreshFailed {
                        attempt: failed,
                        error,
                    } => {
                        if *failed == attempt || rounds >= MAX_REFRESH_ROUNDS {
                            return Err(error.clone());
                        }
                        self.begin_refresh(&mut state, attempt, RefreshMode::Full)
                    }
                }
            };

            rounds += 1;
            task.await;
        }
    }

    /// A request carrying `observed` came back 401.
    ///
    /// Starts a refresh if `observed` is still the current token. A token
    /// that was already replaced, or a refresh already underway, is left
    /// alone.
    pub fn report_unauthorized(&self, observed: &AccessToken, attempt: AttemptId) {
        let mut state = self.inner.state.lock();
        if let AuthState::Authenticated(current) = &*state
            && current == observed
        {
            tracing::info!(%attempt, "Access token rejected, refreshing");
            let _ = self.begin_refresh(&mut state, attempt, RefreshMode::Full);
        }
    }

    /// Move to `Refreshing` and spawn the refresh. Called with the lock held.
    fn begin_refresh(
        &self,
        state: &mut AuthState,
        attempt: AttemptId,
        mode: RefreshMode,
    ) -> RefreshTask {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = inner.acquire(mode).await;
            inner.settle(generation, attempt, outcome);
        });

        let inner = Arc::clone(&self.inner);
        let task = async move {
            if let Err(e) = handle.await {
                inner.settle(generation, attempt, Err(RefreshError::Internal(e.to_string())));
            }
        }
        .boxed()
        .shared();

        *state = AuthState::Refreshing {
            generation,
            task: task.clone(),
        };
        task
    }
}

impl fmt::Debug for TokenAuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthState")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    struct MockSource {
        cached: Option<AccessToken>,
        outcomes: Mutex<VecDeque<Result<Option<AccessToken>, RefreshError>>>,
        fallback: Result<Option<AccessToken>, RefreshError>,
        refresh_calls: AtomicUsize,
        latency: Duration,
    }

    impl MockSource {
        fn new(fallback: Result<Option<AccessToken>, RefreshError>) -> Self {
            Self {
                cached: None,
                outcomes: Mutex::new(VecDeque::new()),
                fallback,
                refresh_calls: AtomicUsize::new(0),
                latency: Duration::from_millis(100),
            }
        }

        fn cached(mut self, token: &str) -> Self {
            self.cached = Some(AccessToken::new(token));
            self
        }

        fn then(self, outcome: Result<Option<AccessToken>, RefreshError>) -> Self {
            self.outcomes.lock().push_back(outcome);
            self
        }

        fn calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialSource for MockSource {
        async fn access_token(&self) -> Option<AccessToken> {
            self.cached.clone()
        }

        async fn refresh_tokens(&self) -> Result<Option<AccessToken>, RefreshError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            let next = self.outcomes.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn token(value: &str) -> Result<Option<AccessToken>, RefreshError> {
        Ok(Some(AccessToken::new(value)))
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = AccessToken::new("secret-value");
        assert!(!format!("{token:?}").contains("secret"));
        assert_eq!(token.header_value(), "Bearer secret-value");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_token_skips_refresh() {
        let source = Arc::new(MockSource::new(token("fresh")).cached("stored"));
        let auth = TokenAuthState::new(source.clone());

        assert_eq!(auth.status(), AuthStatus::Unknown);
        assert_eq!(auth.current_header_value(), None);

        let got = auth.ensure_authenticated(AttemptId::new()).await.unwrap();
        assert_eq!(got.as_str(), "stored");
        assert_eq!(source.calls(), 0);
        assert_eq!(auth.status(), AuthStatus::Authenticated);
        assert_eq!(auth.current_header_value().as_deref(), Some("Bearer stored"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let source = Arc::new(MockSource::new(token("fresh")));
        let auth = TokenAuthState::new(source.clone());

        let mut handles = Vec::new();
        for _ in 0..10 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move {
                auth.ensure_authenticated(AttemptId::new()).await
            }));
        }
        for handle in handles {
            let got = handle.await.unwrap().unwrap();
            assert_eq!(got.as_str(), "fresh");
        }

        assert_eq!(source.calls(), 1);
        assert_eq!(auth.metrics().refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_failure_reaches_every_caller() {
        let source = Arc::new(MockSource::new(Err(RefreshError::NoConnection)));
        let auth = TokenAuthState::new(source.clone());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let auth = auth.clone();
            handles.push(tokio::spawn(async move {
                auth.ensure_authenticated(AttemptId::new()).await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, TransportError::NoConnection { .. }), "{err:?}");
        }

        assert!(source.calls() <= 2, "refresh calls: {}", source.calls());
        assert_eq!(auth.status(), AuthStatus::RefreshFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_callers_failure_is_retried_once() {
        let source = Arc::new(
            MockSource::new(token("fresh")).then(Err(RefreshError::NoConnection)),
        );
        let auth = TokenAuthState::new(source.clone());

        let first = AttemptId::new();
        let err = auth.ensure_authenticated(first).await.unwrap_err();
        assert!(matches!(err, TransportError::NoConnection { .. }));

        // Same caller again: its own failure is terminal.
        let err = auth.ensure_authenticated(first).await.unwrap_err();
        assert!(matches!(err, TransportError::NoConnection { .. }));
        assert_eq!(source.calls(), 1);

        // A different caller refreshes again and succeeds.
        let got = auth.ensure_authenticated(AttemptId::new()).await.unwrap();
        assert_eq!(got.as_str(), "fresh");
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credentials_are_terminal() {
        let source = Arc::new(MockSource::new(Err(RefreshError::Expired)));
        let auth = TokenAuthState::new(source.clone());

        let err = auth.ensure_authenticated(AttemptId::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { .. }));
        assert_eq!(auth.status(), AuthStatus::Unauthorized);

        let err = auth.ensure_authenticated(AttemptId::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { .. }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_without_token_is_unauthorized() {
        let source = Arc::new(MockSource::new(Ok(None)));
        let auth = TokenAuthState::new(source);

        let err = auth.ensure_authenticated(AttemptId::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unauthorized { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_refresh_error_is_not_terminal() {
        let source = Arc::new(
            MockSource::new(token("fresh")).then(Err(RefreshError::Internal("boom".into()))),
        );
        let auth = TokenAuthState::new(source);

        let err = auth.ensure_authenticated(AttemptId::new()).await.unwrap_err();
        assert_eq!(err, TransportError::internal("boom"));
        assert_eq!(auth.status(), AuthStatus::RefreshFailed);

        let got = auth.ensure_authenticated(AttemptId::new()).await.unwrap();
        assert_eq!(got.as_str(), "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_unauthorized_refreshes_current_token_only() {
        let source = Arc::new(
            MockSource::new(token("third"))
                .cached("stale")
                .then(token("second")),
        );
        let auth = TokenAuthState::new(source.clone());

        let stale = auth.ensure_authenticated(AttemptId::new()).await.unwrap();
        assert_eq!(stale.as_str(), "stale");

        let attempt = AttemptId::new();
        auth.report_unauthorized(&stale, attempt);
        assert_eq!(auth.status(), AuthStatus::Refreshing);

        // Reporting the same stale token again while refreshing is a no-op.
        auth.report_unauthorized(&stale, AttemptId::new());

        let fresh = auth.ensure_authenticated(attempt).await.unwrap();
        assert_eq!(fresh.as_str(), "second");
        assert_eq!(source.calls(), 1);

        // The old token no longer matches, nothing happens.
        auth.report_unauthorized(&stale, AttemptId::new());
        assert_eq!(auth.status(), AuthStatus::Authenticated);
        assert_eq!(source.calls(), 1);
    }
}
