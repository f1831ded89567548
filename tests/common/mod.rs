//! In-process stand-in for the platform backend.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use patron::{
    ApiError, ApiRequest, ApiResult, ErrorInfo, MemoryCredentialStore, PatronConfig,
    PlatformClient, Transport, build_client_with,
};
use resilience::RetryConfig;
use serde_json::{Value, json};

pub struct BackendState {
    pub contents: Vec<Value>,
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_revoked: bool,
    pub outage: bool,
    rotation: u32,
}

/// Serves `/auth/*` and `/content` from memory, enforcing bearer tokens.
pub struct FakeBackend {
    pub state: Mutex<BackendState>,
    log: Mutex<Vec<(String, Option<String>)>>,
    calls: AtomicUsize,
    latency: Duration,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                contents: vec![content("c1", "music"), content("c2", "art")],
                access_token: "access-0".into(),
                refresh_token: "refresh-0".into(),
                refresh_revoked: false,
                outage: false,
                rotation: 0,
            }),
            log: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            latency,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(path_and_query, bearer)` of every request received.
    pub fn log(&self) -> Vec<(String, Option<String>)> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.log().iter().filter(|(p, _)| p == path).count()
    }

    /// Server-side expiry: the access token the client holds stops working.
    pub fn expire_access_token(&self) {
        let mut state = self.state.lock().unwrap();
        state.rotation += 1;
        state.access_token = format!("access-{}-expired-rotation", state.rotation);
    }

    pub fn revoke_refresh_token(&self) {
        self.state.lock().unwrap().refresh_revoked = true;
    }

    pub fn set_outage(&self, outage: bool) {
        self.state.lock().unwrap().outage = outage;
    }

    fn route(&self, request: &ApiRequest, token: Option<&str>) -> ApiResult<Value> {
        let mut state = self.state.lock().unwrap();
        if state.outage {
            return Err(ApiError::from_status(503, ErrorInfo::new("maintenance")));
        }

        let method = request.method.as_str();
        match (method, request.path.as_str()) {
            ("POST", "/auth/login") => {
                state.rotation += 1;
                state.access_token = format!("access-{}", state.rotation);
                state.refresh_token = format!("refresh-{}", state.rotation);
                state.refresh_revoked = false;
                return Ok(json!({
                    "user": { "id": "u1", "email": "fan@patron.test", "username": "fan" },
                    "accessToken": state.access_token,
                    "refreshToken": state.refresh_token
                }));
            }
            ("POST", "/auth/refresh") => {
                let presented = request
                    .body
                    .as_ref()
                    .and_then(|b| b.get("refreshToken"))
                    .and_then(Value::as_str);
                if state.refresh_revoked || presented != Some(state.refresh_token.as_str()) {
                    return Err(ApiError::from_status(
                        401,
                        ErrorInfo::new("refresh token invalid").with_code("INVALID_REFRESH"),
                    ));
                }
                state.rotation += 1;
                state.access_token = format!("access-{}", state.rotation);
                state.refresh_token = format!("refresh-{}", state.rotation);
                return Ok(json!({
                    "accessToken": state.access_token,
                    "refreshToken": state.refresh_token
                }));
            }
            _ => {}
        }

        if token != Some(state.access_token.as_str()) {
            return Err(ApiError::from_status(
                401,
                ErrorInfo::new("token expired").with_code("TOKEN_EXPIRED"),
            ));
        }

        match (method, request.path.as_str()) {
            ("GET", "/content") => {
                let category = request.query.get("category");
                let items: Vec<Value> = state
                    .contents
                    .iter()
                    .filter(|c| category.is_none_or(|cat| c["category"] == json!(cat)))
                    .cloned()
                    .collect();
                Ok(page(items))
            }
            ("POST", "/content") => {
                let body = request.body.clone().unwrap_or_default();
                let id = format!("c{}", state.contents.len() + 1);
                let category = body["category"].as_str().unwrap_or("misc").to_string();
                let created = content(&id, &category);
                state.contents.push(created.clone());
                Ok(created)
            }
            ("POST", "/auth/logout") => Ok(Value::Null),
            _ => Err(ApiError::from_status(404, ErrorInfo::new("not found"))),
        }
    }
}

#[async_trait]
impl Transport for FakeBackend {
    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> ApiResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push((request.path_and_query(), token.map(str::to_string)));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.route(request, token)
    }
}

pub fn content(id: &str, category: &str) -> Value {
    json!({ "id": id, "creatorId": "u2", "title": format!("post {id}"), "category": category })
}

pub fn page(items: Vec<Value>) -> Value {
    let total = items.len();
    json!({
        "items": items,
        "pagination": { "page": 1, "limit": 20, "total": total, "pages": 1 }
    })
}

/// Default config with fast, deterministic retries.
pub fn test_config() -> PatronConfig {
    let mut config = PatronConfig::default();
    config.api.retry = RetryConfig::default()
        .with_base_delay(Duration::from_millis(100))
        .with_jitter(false);
    config
}

pub async fn client_for(backend: &Arc<FakeBackend>, config: &PatronConfig) -> PlatformClient {
    build_client_with(
        config,
        Arc::clone(backend) as Arc<dyn Transport>,
        Arc::new(MemoryCredentialStore::new()),
    )
    .await
    .unwrap()
}
