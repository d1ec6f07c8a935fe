//! One physical connection attempt of the update stream.
//!
//! ```text
//! Initial ─► Initializing ─► Connecting(handle) ─► Connected(handle) ─► Finished
//!                 │                  │                     │
//!                 └──────────────────┴─────────────────────┴──► Finished (stop / failure)
//! ```
//!
//! The handle is the cancellation side of the live transfer. It is released
//! on every transition into `Finished`.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    collector::{ChunkCollector, ChunkResult},
    config::StreamingConfig,
    event::{EventParser, SessionEvent},
};
use crate::{
    error::{TransportError, TransportResult},
    metrics::SessionMetrics,
    transport::{Request, StreamChunk, StreamConnection, Transport},
};

/// Why a session reached `Finished`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    /// The server ended the stream cleanly.
    Completed,
    /// [`StreamingSession::stop`] was called or the consumer went away.
    Stopped,
    /// The attempt or the transfer failed.
    Failed(TransportError),
}

/// Payload-free view of the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateKind {
    Initial,
    Initializing,
    Connecting,
    Connected,
    Finished,
}

#[derive(Debug)]
struct ConnectionHandle {
    cancel: CancellationToken,
}

impl ConnectionHandle {
    fn release(self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
enum SessionState {
    Initial,
    Initializing,
    Connecting(ConnectionHandle),
    Connected(ConnectionHandle),
    Finished(FinishReason),
}

impl SessionState {
    fn kind(&self) -> SessionStateKind {
        match self {
            Self::Initial => SessionStateKind::Initial,
            Self::Initializing => SessionStateKind::Initializing,
            Self::Connecting(_) => SessionStateKind::Connecting,
            Self::Connected(_) => SessionStateKind::Connected,
            Self::Finished(_) => SessionStateKind::Finished,
        }
    }
}

type SharedState = Arc<Mutex<SessionState>>;

/// Move to `Finished(reason)` unless already finished, releasing the handle.
fn finish(state: &SharedState, reason: FinishReason) {
    let mut state = state.lock();
    if matches!(&*state, SessionState::Finished(_)) {
        return;
    }
    tracing::debug!(?reason, "Streaming session finished");
    let previous = std::mem::replace(&mut *state, SessionState::Finished(reason));
    if let SessionState::Connecting(handle) | SessionState::Connected(handle) = previous {
        handle.release();
    }
}

/// Ordered events decoded from one session.
///
/// Ends when the session finishes.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    /// Receive the next event, or `None` once the session has finished.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A single connection attempt.
///
/// Dropping the session stops it.
pub struct StreamingSession<T: Transport> {
    transport: Arc<T>,
    request: Request,
    connect_timeout: Duration,
    event_capacity: usize,
    state: SharedState,
    metrics: SessionMetrics,
}

impl<T: Transport> StreamingSession<T> {
    pub fn new(
        transport: Arc<T>,
        request: Request,
        config: &StreamingConfig,
        metrics: SessionMetrics,
    ) -> Self {
        Self {
            transport,
            request,
            connect_timeout: config.connect_timeout,
            event_capacity: config.event_channel_capacity.max(1),
            state: Arc::new(Mutex::new(SessionState::Initial)),
            metrics,
        }
    }

    pub fn state(&self) -> SessionStateKind {
        self.state.lock().kind()
    }

    /// The reason the session finished, once it has.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match &*self.state.lock() {
            SessionState::Finished(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// Open the connection and wait for the response head.
    ///
    /// 2xx allows the body and returns the event stream. Any other status
    /// denies it, so no byte is ever read, and fails with the classified
    /// error (`TokenExpired` for 401).
    pub async fn start(&self) -> TransportResult<SessionEvents> {
        {
            let mut state = self.state.lock();
            if !matches!(&*state, SessionState::Initial) {
                return Err(TransportError::internal("streaming session already started"));
            }
            *state = SessionState::Initializing;
        }
        tracing::debug!(path = %self.request.path, "Opening stream");

        let mut connection = match self.transport.open_stream(self.request.clone()).await {
            Ok(connection) => connection,
            Err(err) => {
                finish(&self.state, FinishReason::Failed(err.clone()));
                return Err(err);
            }
        };

        {
            let mut state = self.state.lock();
            if !matches!(&*state, SessionState::Initializing) {
                connection.cancel();
                return Err(TransportError::Canceled);
            }
            *state = SessionState::Connecting(ConnectionHandle {
                cancel: connection.cancellation(),
            });
        }

        let head = match tokio::time::timeout(self.connect_timeout, connection.response()).await {
            Ok(Ok(head)) => head,
            Ok(Err(err)) => {
                finish(&self.state, FinishReason::Failed(err.clone()));
                return Err(err);
            }
            Err(_) => {
                let err = TransportError::no_connection(format!(
                    "no response within {:?}",
                    self.connect_timeout
                ));
                finish(&self.state, FinishReason::Failed(err.clone()));
                return Err(err);
            }
        };

        if !(200..300).contains(&head.status) {
            connection.deny();
            let err = TransportError::from_status(head.status);
            tracing::debug!(status = head.status, error = %err, "Stream response denied");
            finish(&self.state, FinishReason::Failed(err.clone()));
            return Err(err);
        }

        {
            let mut state = self.state.lock();
            let current = std::mem::replace(&mut *state, SessionState::Initializing);
            match current {
                SessionState::Connecting(handle) => *state = SessionState::Connected(handle),
                other => {
                    *state = other;
                    connection.deny();
                    return Err(TransportError::Canceled);
                }
            }
        }
        connection.allow();
        self.metrics.record_connection();
        tracing::debug!(status = head.status, "Stream connected");

        let (tx, rx) = mpsc::channel(self.event_capacity);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let reason = drain(connection, &tx).await;
            finish(&state, reason);
            drop(tx);
        });

        Ok(SessionEvents { rx })
    }

    /// Cancel the transfer. Idempotent; a no-op once finished.
    pub fn stop(&self) {
        finish(&self.state, FinishReason::Stopped);
    }
}

impl<T: Transport> Drop for StreamingSession<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: Transport> std::fmt::Debug for StreamingSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSession")
            .field("path", &self.request.path)
            .field("state", &self.state())
            .finish()
    }
}

/// Feed body bytes through the collector and parser until the transfer ends.
async fn drain(
    mut connection: StreamConnection,
    tx: &mpsc::Sender<SessionEvent>,
) -> FinishReason {
    let cancel = connection.cancellation();
    let mut collector = ChunkCollector::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return FinishReason::Stopped,
            chunk = connection.next_chunk() => chunk,
        };

        let bytes = match chunk {
            Some(StreamChunk::Bytes(bytes)) => bytes,
            Some(StreamChunk::Finished(None)) => return FinishReason::Completed,
            Some(StreamChunk::Finished(Some(err))) => return FinishReason::Failed(err),
            None => {
                return FinishReason::Failed(TransportError::no_connection(
                    "stream closed without completion",
                ));
            }
        };

        for result in collector.on_bytes(&bytes) {
            let message = match result {
                ChunkResult::Completed(message) => message,
                ChunkResult::Incomplete(_) => continue,
                ChunkResult::BadFormat => {
                    tracing::warn!(len = bytes.len(), "Dropping malformed stream chunk");
                    continue;
                }
            };

            let event = match EventParser::parse(&message) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "Dropping undecodable stream message");
                    continue;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return FinishReason::Stopped,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        return FinishReason::Stopped;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::transport::{Disposition, Response, ResponseHead, stream_channel};

    /// Answers a stream with `status`, then writes `chunks` if allowed.
    struct ScriptedStream {
        status: u16,
        chunks: Vec<&'static str>,
        hold_open: bool,
        body_read: Arc<AtomicBool>,
    }

    impl ScriptedStream {
        fn new(status: u16, chunks: Vec<&'static str>) -> Self {
            Self {
                status,
                chunks,
                hold_open: false,
                body_read: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedStream {
        async fn send(&self, _request: Request) -> TransportResult<Response> {
            Err(TransportError::internal("unused"))
        }

        async fn open_stream(&self, _request: Request) -> TransportResult<StreamConnection> {
            let (mut writer, connection) = stream_channel(8);
            let status = self.status;
            let chunks = self.chunks.clone();
            let hold_open = self.hold_open;
            let body_read = Arc::clone(&self.body_read);
            tokio::spawn(async move {
                if writer.respond(ResponseHead::new(status)).await == Disposition::Deny {
                    return;
                }
                body_read.store(true, Ordering::SeqCst);
                for chunk in chunks {
                    if !writer.send(Bytes::from_static(chunk.as_bytes())).await {
                        return;
                    }
                }
                if hold_open {
                    writer.cancellation().cancelled().await;
                }
                writer.finish(None).await;
            });
            Ok(connection)
        }
    }

    fn session(transport: ScriptedStream) -> StreamingSession<ScriptedStream> {
        StreamingSession::new(
            Arc::new(transport),
            Request::get("/events"),
            &StreamingConfig::new("/events"),
            SessionMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_events_are_decoded_across_chunks() {
        let session = session(ScriptedStream::new(
            200,
            vec![
                "data: {\"type\":\"connected\"}\n\ndata: {\"type\":\"upd",
                "ate\",\"update\":\"operationsPulled\",\"payload\":[{\"id\":7}]}\n\n",
                "data: {\"type\":\"bogus\"}\n\n",
                "data: {\"type\":\"disconnected\"}\n\n",
            ],
        ));
        assert_eq!(session.state(), SessionStateKind::Initial);

        let mut events = session.start().await.unwrap();

        assert_eq!(events.next_event().await, Some(SessionEvent::Connected));
        let Some(SessionEvent::Update(update)) = events.next_event().await else {
            panic!("expected update");
        };
        let crate::sse::event::RemoteUpdate::NewOperationsAvailable(ops) = update;
        assert_eq!(ops.len(), 1);
        assert_eq!(events.next_event().await, Some(SessionEvent::Disconnected));
        assert_eq!(events.next_event().await, None);

        assert_eq!(session.state(), SessionStateKind::Finished);
        assert_eq!(session.finish_reason(), Some(FinishReason::Completed));
    }

    #[tokio::test]
    async fn test_unauthorized_is_denied_without_reading_body() {
        let transport = ScriptedStream::new(401, vec!["data: {\"type\":\"connected\"}\n\n"]);
        let body_read = Arc::clone(&transport.body_read);
        let session = session(transport);

        let err = session.start().await.unwrap_err();
        assert_eq!(err, TransportError::TokenExpired);
        assert_eq!(session.state(), SessionStateKind::Finished);

        tokio::task::yield_now().await;
        assert!(!body_read.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let err = session(ScriptedStream::new(503, vec![])).start().await.unwrap_err();
        assert_eq!(err, TransportError::RetriableHttp { status: 503 });

        let err = session(ScriptedStream::new(404, vec![])).start().await.unwrap_err();
        assert_eq!(err, TransportError::NonRetriableHttp { status: 404 });
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_events() {
        let mut transport = ScriptedStream::new(200, vec!["data: {\"type\":\"connected\"}\n\n"]);
        transport.hold_open = true;
        let session = session(transport);

        let mut events = session.start().await.unwrap();
        assert_eq!(events.next_event().await, Some(SessionEvent::Connected));
        assert_eq!(session.state(), SessionStateKind::Connected);

        session.stop();
        session.stop();
        assert_eq!(session.finish_reason(), Some(FinishReason::Stopped));
        assert_eq!(events.next_event().await, None);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let session = session(ScriptedStream::new(404, vec![]));
        let _ = session.start().await;
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, TransportError::Internal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_head_times_out_as_no_connection() {
        struct Silent;

        #[async_trait]
        impl Transport for Silent {
            async fn send(&self, _request: Request) -> TransportResult<Response> {
                Err(TransportError::internal("unused"))
            }

            async fn open_stream(&self, _request: Request) -> TransportResult<StreamConnection> {
                let (writer, connection) = stream_channel(1);
                tokio::spawn(async move {
                    writer.cancellation().cancelled().await;
                    drop(writer);
                });
                Ok(connection)
            }
        }

        let session = StreamingSession::new(
            Arc::new(Silent),
            Request::get("/events"),
            &StreamingConfig::new("/events").connect_timeout(Duration::from_secs(2)),
            SessionMetrics::new(),
        );
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, TransportError::NoConnection { .. }));
        assert_eq!(session.state(), SessionStateKind::Finished);
    }
}
