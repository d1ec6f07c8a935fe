//! Connection lifecycle hooks for the streaming service.

/// Observes connections made by a
/// [`StreamingService`](super::StreamingService).
///
/// `on_connect` runs once per established connection, before any update of
/// that connection is published. It is the place to issue a catch-up pull.
/// `on_disconnect` runs once when that connection ends.
pub trait StreamObserver: Send + Sync + 'static {
    /// Called when a connection is established (or re-established).
    ///
    /// Default implementation does nothing.
    fn on_connect(&self) {}

    /// Called when a connection is lost or closed.
    ///
    /// Default implementation does nothing.
    fn on_disconnect(&self) {}
}

/// Observer that ignores every lifecycle event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StreamObserver for NoopObserver {}
