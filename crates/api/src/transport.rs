//! The network boundary.
//!
//! [`Transport`] performs exactly one attempt: no retries, no caching, no
//! breaker bookkeeping. Everything resilient lives in the executor above it,
//! so tests swap in scripted transports without touching that logic.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::trace;

use crate::error::{ApiError, ApiResult, ErrorInfo};
use crate::request::{ApiRequest, Method};
use crate::types::Envelope;

/// Sends one request and unwraps the response envelope.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the envelope's `data` (`Value::Null` when absent) or the
    /// classified failure.
    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> ApiResult<Value>;
}

/// `reqwest`-backed transport against a fixed base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(32)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing client, e.g. one with custom TLS or proxy settings.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> ApiResult<Value> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, self.url(&request.path))
            .header("Accept", "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        trace!(status, path = %request.path, "transport_response");
        decode_envelope(status, &body)
    }
}

/// Classify an HTTP status and envelope body.
///
/// Non-2xx statuses win over the envelope flag; a missing or unparsable body
/// on an error status still yields the status-derived error.
pub fn decode_envelope(status: u16, body: &str) -> ApiResult<Value> {
    let parsed = serde_json::from_str::<Envelope<Value>>(body);

    if !(200..300).contains(&status) {
        let info = match parsed {
            Ok(envelope) => envelope
                .error
                .unwrap_or_else(|| ErrorInfo::new(format!("HTTP {status}"))),
            Err(_) if body.trim().is_empty() => ErrorInfo::new(format!("HTTP {status}")),
            Err(_) => ErrorInfo::new(body.trim().to_string()),
        };
        return Err(ApiError::from_status(status, info));
    }

    let envelope = parsed?;
    match envelope.into_result() {
        Ok(data) => Ok(data.unwrap_or(Value::Null)),
        // 2xx carrying `success: false`: the backend rejected the call itself.
        Err(info) => Err(ApiError::Client { status, info }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_envelope_returns_data() {
        let body = r#"{"success":true,"data":{"id":"c1"},"timestamp":"t"}"#;
        assert_eq!(decode_envelope(200, body).unwrap(), json!({ "id": "c1" }));
    }

    #[test]
    fn success_without_data_is_null() {
        let body = r#"{"success":true,"timestamp":"t"}"#;
        assert_eq!(decode_envelope(204, body).unwrap(), Value::Null);
    }

    #[test]
    fn error_status_uses_envelope_error() {
        let body = r#"{"success":false,"error":{"message":"Token expired","code":"TOKEN_EXPIRED"},"timestamp":"t"}"#;
        let err = decode_envelope(401, body).unwrap_err();
        match err {
            ApiError::Unauthorized(info) => {
                assert_eq!(info.message, "Token expired");
                assert_eq!(info.code.as_deref(), Some("TOKEN_EXPIRED"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_status_with_html_body_still_classifies() {
        let err = decode_envelope(503, "<html>Service Unavailable</html>").unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 503, .. }));
        assert_eq!(err.info().unwrap().message, "<html>Service Unavailable</html>");
    }

    #[test]
    fn error_status_with_empty_body() {
        let err = decode_envelope(502, "").unwrap_err();
        assert_eq!(err.info().unwrap().message, "HTTP 502");
    }

    #[test]
    fn ok_status_with_failed_envelope_is_client_error() {
        let body = r#"{"success":false,"error":{"message":"Already subscribed"},"timestamp":"t"}"#;
        let err = decode_envelope(200, body).unwrap_err();
        assert!(matches!(err, ApiError::Client { status: 200, .. }));
    }

    #[test]
    fn garbage_on_ok_status_is_decode_error() {
        assert!(matches!(
            decode_envelope(200, "not json").unwrap_err(),
            ApiError::Decode(_)
        ));
    }

    #[test]
    fn urls_join_cleanly() {
        let transport = HttpTransport::with_client(reqwest::Client::new(), "http://localhost/api/");
        assert_eq!(transport.base_url(), "http://localhost/api");
        assert_eq!(transport.url("/content"), "http://localhost/api/content");
        assert_eq!(transport.url("content"), "http://localhost/api/content");
    }
}
