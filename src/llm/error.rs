//! Model client error types with transient/permanent classification.

use std::time::Duration;

/// Error from a model API call or from reading its response stream.
#[derive(Debug, Clone)]
pub struct LlmError {
    /// The kind of error
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    /// Error message
    pub message: String,
    /// Provider-supplied retry hint (Retry-After header or error body)
    pub retry_after: Option<Duration>,
}

impl LlmError {
    /// Create a rate limit error.
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message: message.into(),
            retry_after,
        }
    }

    /// Create a server error.
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::with_status(LlmErrorKind::ServerError, status_code, message)
    }

    /// Create a client error (bad request, auth, etc.).
    pub fn client_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::with_status(LlmErrorKind::ClientError, status_code, message)
    }

    /// Create a network error.
    pub fn network_error(message: impl Into<String>) -> Self {
        Self::without_status(LlmErrorKind::NetworkError, message)
    }

    /// Create a parse error.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::without_status(LlmErrorKind::ParseError, message)
    }

    /// Create an error raised by the provider inside an otherwise healthy stream.
    pub fn stream_error(message: impl Into<String>) -> Self {
        Self::without_status(LlmErrorKind::StreamError, message)
    }

    /// Build the error matching an HTTP status code.
    pub fn from_status(status_code: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => Self::rate_limited(message, retry_after),
            kind => Self {
                retry_after,
                ..Self::with_status(kind, status_code, message)
            },
        }
    }

    /// Map a transport failure into a network error.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::network_error(format!("Request timeout: {}", error))
        } else if error.is_connect() {
            Self::network_error(format!("Connection failed: {}", error))
        } else if let Some(status) = error.status() {
            Self::from_status(status.as_u16(), error.to_string(), None)
        } else {
            Self::network_error(format!("Request failed: {}", error))
        }
    }

    fn with_status(kind: LlmErrorKind, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: Some(status_code),
            message: message.into(),
            retry_after: None,
        }
    }

    fn without_status(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Check if this error is transient and worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of model errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Rate limited (429)
    RateLimited,
    /// Server error (5xx)
    ServerError,
    /// Client error (400, 401, 403, 404)
    ClientError,
    /// Connection failed or timed out
    NetworkError,
    /// Response body could not be decoded
    ParseError,
    /// The provider reported an error after the stream started
    StreamError,
}

impl LlmErrorKind {
    /// Check if this error kind is transient.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited
                | LlmErrorKind::ServerError
                | LlmErrorKind::NetworkError
                | LlmErrorKind::StreamError
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::ServerError => write!(f, "Server error"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::NetworkError => write!(f, "Network error"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
            LlmErrorKind::StreamError => write!(f, "Stream error"),
        }
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500..=599 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}
