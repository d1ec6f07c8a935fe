//! Core transport abstractions and types.
//!
//! A [`Transport`] performs exactly one HTTP exchange per call. It knows
//! nothing about tokens, retries or concurrency limits; those are layered on
//! top by [`Retrier`](crate::retry::Retrier),
//! [`TokenAuthState`](crate::auth::TokenAuthState) and
//! [`ConcurrencyLimitedExecutor`](crate::executor::ConcurrencyLimitedExecutor).

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};

/// Unique identifier for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP method enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
            Method::Patch => write!(f, "PATCH"),
            Method::Head => write!(f, "HEAD"),
            Method::Options => write!(f, "OPTIONS"),
        }
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Delete => http::Method::DELETE,
            Method::Patch => http::Method::PATCH,
            Method::Head => http::Method::HEAD,
            Method::Options => http::Method::OPTIONS,
        }
    }
}

/// A single HTTP request, addressed by path relative to the transport's
/// base URL (absolute URLs are passed through).
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique identifier for this request
    pub id: RequestId,

    /// HTTP method
    pub method: Method,

    /// Request path or absolute URL
    pub path: String,

    /// Request headers
    pub headers: HashMap<String, String>,

    /// Query parameters
    pub query: Vec<(String, String)>,

    /// Request body
    pub body: Option<Bytes>,

    /// Total request timeout; `None` uses the transport default.
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a new request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            method,
            path: path.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Create a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Create a PUT request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    /// Create a DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Add a header to the request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter to the request.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the request body as JSON.
    pub fn json<T: Serialize>(mut self, data: &T) -> TransportResult<Self> {
        let json_str = serde_json::to_string(data)?;
        self.body = Some(json_str.into());
        self.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        Ok(self)
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a bearer token, replacing any previous `Authorization` header.
    pub fn bearer(self, header_value: impl Into<String>) -> Self {
        self.header(http::header::AUTHORIZATION.as_str(), header_value)
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Request ID this response corresponds to
    pub request_id: RequestId,

    /// Response status code
    pub status: u16,

    /// Response headers
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Bytes,

    /// Response timestamp
    pub received_at: SystemTime,
}

impl Response {
    /// Create a new response.
    pub fn new(request_id: RequestId, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            status,
            headers: HashMap::new(),
            body: body.into(),
            received_at: SystemTime::now(),
        }
    }

    /// Check if the response indicates success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the response body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> TransportResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Get the response body as text.
    pub fn text(&self) -> TransportResult<String> {
        Ok(String::from_utf8(self.body.to_vec())?)
    }

    /// Get a header value.
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(name)
    }
}

/// Status line and headers of a streaming response, delivered before any
/// body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Response status code
    pub status: u16,
    /// Response headers
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    /// Create a head with the given status and no headers.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
        }
    }
}

/// Whether the consumer accepts the body of a streaming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Start delivering body bytes.
    Allow,
    /// Drop the response without reading the body.
    Deny,
}

/// One item on the byte channel of a [`StreamConnection`].
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A chunk of body bytes, split wherever the network split it.
    Bytes(Bytes),
    /// The transfer ended, with or without an error.
    Finished(Option<TransportError>),
}

/// Consumer half of a streaming transfer.
///
/// The response head arrives on its own channel so the consumer can decide
/// the [`Disposition`] before a single body byte is produced. Body bytes then
/// arrive on a separate channel.
#[derive(Debug)]
pub struct StreamConnection {
    head_rx: Option<oneshot::Receiver<TransportResult<ResponseHead>>>,
    disposition_tx: Option<oneshot::Sender<Disposition>>,
    chunk_rx: mpsc::Receiver<StreamChunk>,
    cancel: CancellationToken,
}

impl StreamConnection {
    /// Wait for the response head.
    ///
    /// Fails with `NoConnection` if the producer went away before answering,
    /// and with `Canceled` if the transfer was canceled while waiting.
    pub async fn response(&mut self) -> TransportResult<ResponseHead> {
        let Some(head_rx) = self.head_rx.take() else {
            return Err(TransportError::internal("response head already consumed"));
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Canceled),
            head = head_rx => match head {
                Ok(head) => head,
                Err(_) => Err(TransportError::no_connection(
                    "transfer ended before a response arrived",
                )),
            },
        }
    }

    /// Accept the response body.
    pub fn allow(&mut self) {
        self.decide(Disposition::Allow);
    }

    /// Reject the response body; no bytes will be delivered.
    pub fn deny(&mut self) {
        self.decide(Disposition::Deny);
    }

    fn decide(&mut self, disposition: Disposition) {
        if let Some(tx) = self.disposition_tx.take() {
            let _ = tx.send(disposition);
        }
    }

    /// Receive the next item from the byte channel.
    ///
    /// `None` means the producer dropped without a `Finished` marker.
    pub async fn next_chunk(&mut self) -> Option<StreamChunk> {
        self.chunk_rx.recv().await
    }

    /// Cancel the underlying transfer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that fires when the transfer is canceled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Producer half of a streaming transfer, owned by a [`Transport`]
/// implementation.
#[derive(Debug)]
pub struct StreamWriter {
    head_tx: Option<oneshot::Sender<TransportResult<ResponseHead>>>,
    disposition_rx: Option<oneshot::Receiver<Disposition>>,
    chunk_tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
}

impl StreamWriter {
    /// Publish the response head and wait for the consumer's decision.
    ///
    /// A consumer that disappears counts as [`Disposition::Deny`].
    pub async fn respond(&mut self, head: ResponseHead) -> Disposition {
        let (Some(head_tx), Some(disposition_rx)) =
            (self.head_tx.take(), self.disposition_rx.take())
        else {
            return Disposition::Deny;
        };
        if head_tx.send(Ok(head)).is_err() {
            return Disposition::Deny;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Disposition::Deny,
            decision = disposition_rx => decision.unwrap_or(Disposition::Deny),
        }
    }

    /// Report that no response could be obtained.
    pub fn fail(mut self, error: TransportError) {
        if let Some(head_tx) = self.head_tx.take() {
            let _ = head_tx.send(Err(error));
        }
    }

    /// Deliver body bytes. Returns `false` once the consumer is gone.
    pub async fn send(&self, bytes: Bytes) -> bool {
        self.chunk_tx.send(StreamChunk::Bytes(bytes)).await.is_ok()
    }

    /// Mark the end of the transfer.
    pub async fn finish(self, error: Option<TransportError>) {
        let _ = self.chunk_tx.send(StreamChunk::Finished(error)).await;
    }

    /// Token that fires when the consumer cancels the transfer.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Create a connected [`StreamWriter`] / [`StreamConnection`] pair whose
/// byte channel holds at most `capacity` chunks.
pub fn stream_channel(capacity: usize) -> (StreamWriter, StreamConnection) {
    let (head_tx, head_rx) = oneshot::channel();
    let (disposition_tx, disposition_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(capacity.max(1));
    let cancel = CancellationToken::new();

    let writer = StreamWriter {
        head_tx: Some(head_tx),
        disposition_rx: Some(disposition_rx),
        chunk_tx,
        cancel: cancel.clone(),
    };
    let connection = StreamConnection {
        head_rx: Some(head_rx),
        disposition_tx: Some(disposition_tx),
        chunk_rx,
        cancel,
    };
    (writer, connection)
}

/// Core transport trait: one HTTP exchange per call.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a request and return the buffered response, whatever its status.
    ///
    /// Errors are reserved for exchanges that produced no response at all.
    async fn send(&self, request: Request) -> TransportResult<Response>;

    /// Open a streaming request.
    ///
    /// Returns as soon as the transfer has been started; the response head
    /// and body are delivered through the returned [`StreamConnection`].
    async fn open_stream(&self, request: Request) -> TransportResult<StreamConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_creation() {
        let request = Request::get("/groups")
            .header("Accept", "application/json")
            .query("limit", "10")
            .timeout(Duration::from_secs(30));

        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/groups");
        assert_eq!(
            request.headers.get("Accept"),
            Some(&"application/json".to_string())
        );
        assert_eq!(request.query, vec![("limit".to_string(), "10".to_string())]);
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_request_json() {
        #[derive(Serialize)]
        struct NewGroup {
            name: String,
        }

        let request = Request::post("/groups")
            .json(&NewGroup {
                name: "trip".to_string(),
            })
            .expect("serializable body");

        assert_eq!(request.body.as_deref(), Some(b"{\"name\":\"trip\"}".as_slice()));
        assert_eq!(
            request.headers.get("Content-Type"),
            Some(&"application/json".to_string())
        );
    }

    #[test]
    fn test_bearer_replaces_previous_token() {
        let request = Request::get("/me").bearer("Bearer old").bearer("Bearer new");
        assert_eq!(
            request.headers.get("authorization"),
            Some(&"Bearer new".to_string())
        );
    }

    #[test]
    fn test_response_helpers() {
        let response = Response::new(RequestId::new(), 200, "{\"id\":7}");
        assert!(response.is_success());
        let value: serde_json::Value = response.json().expect("json body");
        assert_eq!(value["id"], 7);

        let response = Response::new(RequestId::new(), 404, "missing");
        assert!(!response.is_success());
        assert_eq!(response.text().expect("utf8"), "missing");
    }

    #[test]
    fn test_method_conversion() {
        let method: http::Method = Method::Patch.into();
        assert_eq!(method, http::Method::PATCH);
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }

    #[tokio::test]
    async fn test_stream_channel_allow_delivers_bytes() {
        let (mut writer, mut connection) = stream_channel(4);

        let producer = tokio::spawn(async move {
            if writer.respond(ResponseHead::new(200)).await == Disposition::Allow {
                assert!(writer.send(Bytes::from_static(b"data: {}\n\n")).await);
                writer.finish(None).await;
            }
        });

        let head = connection.response().await.expect("head");
        assert_eq!(head.status, 200);
        connection.allow();

        match connection.next_chunk().await {
            Some(StreamChunk::Bytes(bytes)) => assert_eq!(&bytes[..], b"data: {}\n\n"),
            other => panic!("unexpected chunk: {other:?}"),
        }
        assert!(matches!(
            connection.next_chunk().await,
            Some(StreamChunk::Finished(None))
        ));
        producer.await.expect("producer");
    }

    #[tokio::test]
    async fn test_stream_channel_deny_produces_no_bytes() {
        let (mut writer, mut connection) = stream_channel(4);

        let producer = tokio::spawn(async move { writer.respond(ResponseHead::new(401)).await });

        let head = connection.response().await.expect("head");
        assert_eq!(head.status, 401);
        connection.deny();

        assert_eq!(producer.await.expect("producer"), Disposition::Deny);
        assert!(connection.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_channel_fail_before_head() {
        let (writer, mut connection) = stream_channel(4);
        writer.fail(TransportError::no_connection("refused"));

        let err = connection.response().await.expect_err("should fail");
        assert!(matches!(err, TransportError::NoConnection { .. }));
    }

    #[tokio::test]
    async fn test_stream_channel_cancel_while_waiting() {
        let (_writer, mut connection) = stream_channel(4);
        connection.cancel();
        let err = connection.response().await.expect_err("canceled");
        assert_eq!(err, TransportError::Canceled);
    }
}
