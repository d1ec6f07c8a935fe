//! Streaming connection configuration.

use std::{collections::HashMap, time::Duration};

use super::subscription::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::{
    reconnect::BackoffConfig,
    transport::{Method, Request},
};

/// Configuration for the update stream and its reconnect loop.
///
/// Defaults reconnect after a fixed 5 seconds, with no growth and no jitter.
#[derive(Clone, Debug)]
pub struct StreamingConfig {
    /// Stream path, relative to the transport's base URL.
    pub path: String,
    /// HTTP method (usually GET).
    pub method: Method,
    /// Additional headers sent on every connection attempt.
    pub headers: HashMap<String, String>,
    /// How long to wait for the response head.
    pub connect_timeout: Duration,
    /// Delay before reconnecting after a failed attempt.
    pub reconnect_delay: Duration,
    /// Growth factor applied per consecutive failure (1.0 = fixed).
    pub reconnect_backoff_factor: f64,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Random jitter factor (0.0–1.0) for reconnect delays.
    pub reconnect_jitter: f64,
    /// How often to re-check for a signed-in session while there is none.
    pub idle_poll_interval: Duration,
    /// Capacity of a session's event channel.
    pub event_channel_capacity: usize,
    /// Updates queued per subscriber before further ones are dropped.
    pub subscriber_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            method: Method::Get,
            headers: HashMap::new(),
            connect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            reconnect_backoff_factor: 1.0,
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_jitter: 0.0,
            idle_poll_interval: Duration::from_secs(5),
            event_channel_capacity: 256,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl StreamingConfig {
    /// Create a configuration for the given stream path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header sent on every connection attempt.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn reconnect_backoff_factor(mut self, factor: f64) -> Self {
        self.reconnect_backoff_factor = factor;
        self
    }

    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: f64) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    #[must_use]
    pub fn idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// The request opened on every connection attempt, without credentials.
    pub(crate) fn request(&self) -> Request {
        let mut request = Request::new(self.method, &self.path)
            .header(http::header::ACCEPT.as_str(), "text/event-stream");
        for (name, value) in &self.headers {
            request = request.header(name.clone(), value.clone());
        }
        request
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.reconnect_delay,
            max_delay: self.reconnect_max_delay.max(self.reconnect_delay),
            factor: self.reconnect_backoff_factor,
            jitter: self.reconnect_jitter,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err("Stream path cannot be empty".to_string());
        }
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.idle_poll_interval.is_zero() {
            return Err("Idle poll interval must be > 0".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err("Event channel capacity must be > 0".to_string());
        }
        if self.subscriber_capacity == 0 {
            return Err("Subscriber capacity must be > 0".to_string());
        }
        self.backoff().validate()
    }
}
