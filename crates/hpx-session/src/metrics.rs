//! Counters for the session layer.
//!
//! Each counter is reported to the global OpenTelemetry meter (a no-op until
//! the host application installs a provider) and mirrored in an atomic so it
//! can be read back directly.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{KeyValue, global, metrics::Counter};

/// Shared session counters. Cloning shares the underlying values.
#[derive(Clone)]
pub struct SessionMetrics {
    requests: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    refreshes: Arc<AtomicU64>,
    connections: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    otlp_requests: Counter<u64>,
    otlp_failures: Counter<u64>,
    otlp_refreshes: Counter<u64>,
    otlp_connections: Counter<u64>,
    otlp_reconnects: Counter<u64>,
}

impl SessionMetrics {
    /// Create a fresh set of counters.
    pub fn new() -> Self {
        let meter = global::meter("hpx-session");
        Self {
            requests: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            refreshes: Arc::new(AtomicU64::new(0)),
            connections: Arc::new(AtomicU64::new(0)),
            reconnects: Arc::new(AtomicU64::new(0)),
            otlp_requests: meter
                .u64_counter("session.http.requests")
                .with_description("Requests submitted to the executor")
                .build(),
            otlp_failures: meter
                .u64_counter("session.http.failures")
                .with_description("Submitted requests that settled with an error")
                .build(),
            otlp_refreshes: meter
                .u64_counter("session.auth.refreshes")
                .with_description("Token refresh network calls")
                .build(),
            otlp_connections: meter
                .u64_counter("session.stream.connections")
                .with_description("Streaming connections established")
                .build(),
            otlp_reconnects: meter
                .u64_counter("session.stream.reconnects")
                .with_description("Reconnect attempts scheduled after a failure")
                .build(),
        }
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.otlp_requests.add(1, &[]);
    }

    pub(crate) fn record_failure(&self, kind: &'static str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.otlp_failures.add(1, &[KeyValue::new("error", kind)]);
    }

    pub(crate) fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        self.otlp_refreshes.add(1, &[]);
    }

    pub(crate) fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.otlp_connections.add(1, &[]);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.otlp_reconnects.add(1, &[]);
    }

    /// Requests submitted.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Requests that failed.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Token refresh network calls.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Streaming connections established.
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Reconnects scheduled.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMetrics")
            .field("requests", &self.request_count())
            .field("failures", &self.failure_count())
            .field("refreshes", &self.refresh_count())
            .field("connections", &self.connection_count())
            .field("reconnects", &self.reconnect_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = SessionMetrics::new();
        let shared = metrics.clone();

        metrics.record_request();
        metrics.record_request();
        shared.record_failure("no_connection");
        shared.record_refresh();
        metrics.record_connection();
        metrics.record_reconnect();

        assert_eq!(shared.request_count(), 2);
        assert_eq!(metrics.failure_count(), 1);
        assert_eq!(metrics.refresh_count(), 1);
        assert_eq!(shared.connection_count(), 1);
        assert_eq!(shared.reconnect_count(), 1);
    }
}
