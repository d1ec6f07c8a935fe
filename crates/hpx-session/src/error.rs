//! Closed error taxonomy for the session layer.
//!
//! Every failure surfaced by the executor, the token state machine and the
//! streaming service is one of the [`TransportError`] variants below. Callers
//! match on it exhaustively; there is no downcasting to find out whether an
//! error "is really" a connectivity problem.

use thiserror::Error;

/// The main result type used throughout the session layer.
pub type TransportResult<T> = Result<T, TransportError>;

/// Error type for all network operations.
///
/// `Clone` so that one refresh outcome can be handed to every caller waiting
/// on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The network could not be reached (DNS, connect, timeout, reset).
    #[error("No connection: {message}")]
    NoConnection { message: String },

    /// Credentials are gone for good; the session must be torn down.
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// The server rejected the access token with a 401.
    #[error("Access token expired")]
    TokenExpired,

    /// 408, 429 or 5xx.
    #[error("Retriable HTTP status {status}")]
    RetriableHttp { status: u16 },

    /// Any other non-2xx status.
    #[error("Non-retriable HTTP status {status}")]
    NonRetriableHttp { status: u16 },

    /// The peer answered with something that is not an HTTP response.
    #[error("Response was not an HTTP response")]
    NonHttpResponse,

    /// A body or frame could not be decoded.
    #[error("Decoding failed: {message}")]
    Decoding { message: String },

    /// The operation was canceled by its owner.
    #[error("Operation canceled")]
    Canceled,

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TransportError {
    /// Create a connectivity error.
    pub fn no_connection(message: impl Into<String>) -> Self {
        Self::NoConnection {
            message: message.into(),
        }
    }

    /// Create a terminal authorization error.
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create a decoding error.
    pub fn decoding(message: impl Into<String>) -> Self {
        Self::Decoding {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify a non-2xx HTTP status.
    ///
    /// 401 maps to [`TokenExpired`](Self::TokenExpired), 408/429/5xx to
    /// [`RetriableHttp`](Self::RetriableHttp) and everything else to
    /// [`NonRetriableHttp`](Self::NonRetriableHttp).
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::TokenExpired,
            408 | 429 | 500..=599 => Self::RetriableHttp { status },
            _ => Self::NonRetriableHttp { status },
        }
    }

    /// Whether a reconnect or a later retry may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NoConnection { .. } | Self::RetriableHttp { .. } | Self::TokenExpired
        )
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::decoding(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for TransportError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        Self::decoding(e.to_string())
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        // A body error is a transfer cut short, not a malformed payload.
        if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
            Self::no_connection(e.to_string())
        } else if e.is_decode() {
            Self::decoding(e.to_string())
        } else {
            Self::internal(e.to_string())
        }
    }
}

/// Failure reported by a [`CredentialSource`](crate::auth::CredentialSource)
/// refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The refresh endpoint could not be reached.
    #[error("refresh failed: no connection")]
    NoConnection,
    /// The refresh credential itself has expired or was revoked.
    #[error("refresh failed: credentials expired")]
    Expired,
    /// Anything else the credential source reports.
    #[error("refresh failed: {0}")]
    Internal(String),
}
