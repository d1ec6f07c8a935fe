//! HTTP transport over `reqwest`.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder};

use crate::{
    error::{TransportError, TransportResult},
    transport::{
        Disposition, Request, Response, ResponseHead, StreamConnection, StreamWriter, Transport,
        stream_channel,
    },
};

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base URL for all requests
    pub base_url: String,

    /// Default total timeout for buffered requests
    pub timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Idle timeout between reads. Streams can stay quiet for a long time,
    /// so this is measured in minutes.
    pub read_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Default headers to include with all requests
    pub default_headers: HashMap<String, String>,

    /// Chunks buffered between the network and a stream consumer
    pub stream_buffer: usize,
}

impl HttpConfig {
    /// Create a new HTTP configuration with defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5 * 60),
            user_agent: concat!("hpx-session/", env!("CARGO_PKG_VERSION")).to_string(),
            default_headers: HashMap::new(),
            stream_buffer: 64,
        }
    }

    /// Create a builder for the HTTP configuration.
    pub fn builder(base_url: impl Into<String>) -> HttpConfigBuilder {
        HttpConfigBuilder::new(base_url)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TransportResult<()> {
        if self.base_url.is_empty() {
            return Err(TransportError::config("Base URL cannot be empty"));
        }

        if self.timeout.is_zero() {
            return Err(TransportError::config("Timeout cannot be zero"));
        }

        if self.read_timeout.is_zero() {
            return Err(TransportError::config("Read timeout cannot be zero"));
        }

        if self.stream_buffer == 0 {
            return Err(TransportError::config("Stream buffer cannot be zero"));
        }

        url::Url::parse(&self.base_url)
            .map_err(|e| TransportError::config(format!("Invalid base URL: {e}")))?;

        Ok(())
    }

    /// Resolve a request path against the base URL and append the query.
    fn url_for(&self, request: &Request) -> TransportResult<url::Url> {
        let raw = if request.path.starts_with("http://") || request.path.starts_with("https://") {
            request.path.clone()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                request.path.trim_start_matches('/')
            )
        };

        let mut url = url::Url::parse(&raw)
            .map_err(|e| TransportError::config(format!("Invalid URL {raw}: {e}")))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &request.query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }
}

/// Builder for HTTP configuration.
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    /// Create a new builder.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: HttpConfig::new(base_url),
        }
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the idle read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a default header.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.into(), value.into());
        self
    }

    /// Add multiple default headers.
    pub fn default_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.config
                .default_headers
                .insert(name.into(), value.into());
        }
        self
    }

    /// Set the stream chunk buffer.
    pub fn stream_buffer(mut self, capacity: usize) -> Self {
        self.config.stream_buffer = capacity;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportResult<HttpConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: HttpConfig,
}

impl HttpTransport {
    /// Create a transport from a validated configuration.
    pub fn new(config: HttpConfig) -> TransportResult<Self> {
        config.validate()?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| TransportError::config(format!("Failed to build client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Get the transport configuration.
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn prepare(&self, request: &Request, streaming: bool) -> TransportResult<RequestBuilder> {
        let url = self.config.url_for(request)?;
        let mut builder = self.client.request(request.method.into(), url);

        for (name, value) in &self.config.default_headers {
            builder = builder.header(name, value);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        // A total timeout would cut a healthy stream; streams rely on the
        // read timeout instead.
        if !streaming {
            builder = builder.timeout(request.timeout.unwrap_or(self.config.timeout));
        }
        Ok(builder)
    }
}

fn collect_headers(headers: &http::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> TransportResult<Response> {
        let builder = self.prepare(&request, false)?;
        tracing::debug!(request_id = %request.id, method = %request.method, path = %request.path, "Sending request");

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await?;

        tracing::debug!(request_id = %request.id, status, "Received response");
        let mut response = Response::new(request.id, status, body);
        response.headers = headers;
        Ok(response)
    }

    async fn open_stream(&self, request: Request) -> TransportResult<StreamConnection> {
        let builder = self.prepare(&request, true)?;
        let (writer, connection) = stream_channel(self.config.stream_buffer);
        tracing::debug!(request_id = %request.id, path = %request.path, "Opening stream");

        tokio::spawn(drive_stream(builder, writer));
        Ok(connection)
    }
}

/// Send the request, hand over the head, then pump body bytes until the
/// body ends, the consumer denies or cancels, or the network fails.
async fn drive_stream(builder: RequestBuilder, mut writer: StreamWriter) {
    let cancel = writer.cancellation();

    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = builder.send() => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(error = %e, "Stream request failed");
            writer.fail(e.into());
            return;
        }
    };

    let head = ResponseHead {
        status: response.status().as_u16(),
        headers: collect_headers(response.headers()),
    };
    if writer.respond(head).await == Disposition::Deny {
        return;
    }

    let mut body = response.bytes_stream();
    let error = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = body.next() => next,
        };
        match next {
            Some(Ok(bytes)) => {
                if !writer.send(bytes).await {
                    return;
                }
            }
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Stream body failed");
                break Some(TransportError::from(e));
            }
            None => break None,
        }
    };
    writer.finish(error).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Method;

    #[test]
    fn test_builder_defaults_and_overrides() {
        let config = HttpConfig::builder("https://api.example.com/v1")
            .timeout(Duration::from_secs(5))
            .read_timeout(Duration::from_secs(600))
            .user_agent("test-agent")
            .default_header("X-App", "mobile")
            .default_headers([("X-A", "1"), ("X-B", "2")])
            .stream_buffer(16)
            .build()
            .unwrap();

        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(600));
        assert_eq!(config.user_agent, "test-agent");
        assert_eq!(config.default_headers.len(), 3);
        assert_eq!(config.stream_buffer, 16);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            HttpConfig::builder("").build(),
            Err(TransportError::Config { .. })
        ));
        assert!(matches!(
            HttpConfig::builder("not a url").build(),
            Err(TransportError::Config { .. })
        ));
        assert!(matches!(
            HttpConfig::builder("https://example.com")
                .timeout(Duration::ZERO)
                .build(),
            Err(TransportError::Config { .. })
        ));
    }

    #[test]
    fn test_url_resolution() {
        let config = HttpConfig::new("https://api.example.com/v1/");

        let url = config
            .url_for(&Request::get("/events").query("since", "42"))
            .unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/events?since=42");

        let url = config
            .url_for(&Request::new(Method::Get, "https://other.example.com/x"))
            .unwrap();
        assert_eq!(url.as_str(), "https://other.example.com/x");
    }
}
