//! In-process transports for unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ApiError, ApiResult, ErrorInfo};
use crate::request::{ApiRequest, Method};
use crate::transport::Transport;

type Handler = dyn Fn(&ApiRequest, Option<&str>, usize) -> ApiResult<Value> + Send + Sync;

/// Answers each request from a closure, after an optional delay, and records
/// everything it was sent.
pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    latency: Duration,
    sent: Mutex<Vec<(Method, String, Option<String>)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(
        handler: impl Fn(&ApiRequest, Option<&str>, usize) -> ApiResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            latency: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// `(path_and_query, token)` of every request, in send order.
    pub(crate) fn sent(&self) -> Vec<(String, Option<String>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, path, token)| (path.clone(), token.clone()))
            .collect()
    }

    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> ApiResult<Value> {
        let index = {
            let mut sent = self.sent.lock().unwrap();
            sent.push((
                request.method,
                request.path_and_query(),
                token.map(str::to_string),
            ));
            sent.len() - 1
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.handler)(request, token, index)
    }
}

pub(crate) fn status(status: u16, message: &str) -> ApiError {
    ApiError::from_status(status, ErrorInfo::new(message))
}
