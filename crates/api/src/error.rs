use resilience::{is_retryable_status, Retryable, Superseded};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error payload carried by a failed backend envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors surfaced by every client operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// Connection-level failure; the request may never have reached the backend.
    #[error("network failure: {0}")]
    Network(String),
    /// 408 from the backend or the per-attempt deadline expired.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// 429 from the backend.
    #[error("rate limited: {0}")]
    RateLimited(ErrorInfo),
    /// 5xx from the backend.
    #[error("server error {status}: {info}")]
    Server { status: u16, info: ErrorInfo },
    /// 4xx other than 401/408/429: malformed request, forbidden, not found.
    #[error("request rejected with {status}: {info}")]
    Client { status: u16, info: ErrorInfo },
    /// 401: the access credential was rejected.
    #[error("authorization expired: {0}")]
    Unauthorized(ErrorInfo),
    /// The circuit breaker refused the call without touching the network.
    #[error("circuit breaker is open; backend temporarily unavailable")]
    CircuitOpen,
    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
    /// A newer debounced call replaced this one.
    #[error(transparent)]
    Superseded(#[from] Superseded),
    /// The operation needs a stored credential and there is none.
    #[error("not authenticated")]
    NotAuthenticated,
    /// The durable credential store failed.
    #[error("credential storage failure: {0}")]
    Storage(String),
}

impl ApiError {
    /// Map an HTTP status and backend error payload onto the taxonomy.
    pub fn from_status(status: u16, info: ErrorInfo) -> Self {
        match status {
            401 => ApiError::Unauthorized(info),
            408 => ApiError::Timeout(info.message),
            429 => ApiError::RateLimited(info),
            500..=599 => ApiError::Server { status, info },
            _ => ApiError::Client { status, info },
        }
    }

    /// HTTP status behind this error, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized(_) => Some(401),
            ApiError::RateLimited(_) => Some(429),
            ApiError::Server { status, .. } | ApiError::Client { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Backend error payload, for UI layers that render actionable text.
    pub fn info(&self) -> Option<&ErrorInfo> {
        match self {
            ApiError::RateLimited(info) | ApiError::Unauthorized(info) => Some(info),
            ApiError::Server { info, .. } | ApiError::Client { info, .. } => Some(info),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }

    /// Stable machine-readable label, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Network(_) => "NETWORK",
            ApiError::Timeout(_) => "TIMEOUT",
            ApiError::RateLimited(_) => "RATE_LIMITED",
            ApiError::Server { .. } => "SERVER_ERROR",
            ApiError::Client { .. } => "CLIENT_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::CircuitOpen => "CIRCUIT_OPEN",
            ApiError::Decode(_) => "DECODE_ERROR",
            ApiError::Superseded(_) => "SUPERSEDED",
            ApiError::NotAuthenticated => "NOT_AUTHENTICATED",
            ApiError::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Timeout(_) | ApiError::RateLimited(_) => true,
            ApiError::Server { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status.as_u16(), ErrorInfo::new(err.to_string()))
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}
