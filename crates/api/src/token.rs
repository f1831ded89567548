//! Credential holding, persistence and refresh.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ApiResult};
use crate::request::ApiRequest;
use crate::transport::Transport;

/// Access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: None,
        }
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expiry from the access token's `exp` claim, else the stored `expires_at`.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        jwt_expiry(&self.access_token).or(self.expires_at)
    }
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Read `exp` from an unverified JWT. Opaque tokens yield `None`.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claims.exp?, 0).single()
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        ApiError::Storage(err.to_string())
    }
}

/// Durable key/value home for the credential.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<Credential>, CredentialError>;
    async fn save(&self, credential: &Credential) -> Result<(), CredentialError>;
    async fn clear(&self) -> Result<(), CredentialError>;
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Credential>> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, CredentialError> {
        Ok(self.lock().clone())
    }

    async fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        *self.lock() = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        *self.lock() = None;
        Ok(())
    }
}

/// JSON file store. Writes go through a sibling temp file and a rename.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, CredentialError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, credential: &Credential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(credential)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        match tokio::fs::remove_file(&self.path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Owns the current credential and refreshes it against the backend.
pub struct TokenManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    refresh_path: String,
    request_timeout: Duration,
    current: RwLock<Option<Credential>>,
    refresh_lock: tokio::sync::Mutex<()>,
    refreshes: AtomicU64,
}

impl TokenManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            store,
            refresh_path: refresh_path.into(),
            request_timeout: Duration::from_secs(30),
            current: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Bound on the refresh exchange. The refresh lock is held for its
    /// duration, so a stalled endpoint must not hold it forever.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Load the persisted credential into memory.
    pub async fn restore(&self) -> ApiResult<bool> {
        let loaded = self.store.load().await?;
        let found = loaded.is_some();
        *self.write() = loaded;
        debug!(found, "credential_restored");
        Ok(found)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<Credential>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<Credential>> {
        self.current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_token(&self) -> Option<String> {
        self.read().as_ref().map(|c| c.access_token.clone())
    }

    pub fn credential(&self) -> Option<Credential> {
        self.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_some()
    }

    /// `true` when the credential's known expiry is less than an hour away.
    /// Unknown expiry and no credential both count as not expiring.
    pub fn is_expiring_soon(&self) -> bool {
        self.read()
            .as_ref()
            .and_then(Credential::expiry)
            .is_some_and(|expiry| expiry - Utc::now() < ChronoDuration::hours(1))
    }

    /// Persist and adopt a credential.
    pub async fn set(&self, credential: Credential) -> ApiResult<()> {
        self.store.save(&credential).await?;
        *self.write() = Some(credential);
        Ok(())
    }

    /// Forget the credential in memory and in the store.
    pub async fn clear(&self) -> ApiResult<()> {
        *self.write() = None;
        self.store.clear().await?;
        Ok(())
    }

    /// Exchange the refresh token for a new pair. Any failure clears the
    /// stored credential.
    pub async fn refresh(&self) -> ApiResult<Credential> {
        let refresh_token = self
            .read()
            .as_ref()
            .map(|c| c.refresh_token.clone())
            .ok_or(ApiError::NotAuthenticated)?;

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        match self.exchange(&refresh_token).await {
            Ok(credential) => {
                self.set(credential.clone()).await?;
                info!("credential_refreshed");
                Ok(credential)
            }
            Err(err) => {
                warn!(error = %err, "credential_refresh_failed");
                if let Err(clear_err) = self.clear().await {
                    warn!(error = %clear_err, "credential_clear_failed");
                }
                Err(err)
            }
        }
    }

    async fn exchange(&self, refresh_token: &str) -> ApiResult<Credential> {
        let request = ApiRequest::post(self.refresh_path.as_str())
            .anonymous()
            .json(&RefreshRequest { refresh_token })?;
        let data = tokio::time::timeout(self.request_timeout, self.transport.send(&request, None))
            .await
            .map_err(|_| {
                ApiError::Timeout(format!(
                    "refresh gave no response within {}ms",
                    self.request_timeout.as_millis()
                ))
            })??;
        Ok(serde_json::from_value(data)?)
    }

    /// Refresh unless another task already replaced `failed_token`, in which
    /// case the newer token is returned. Refreshes are serialized.
    pub async fn refresh_if_stale(&self, failed_token: Option<&str>) -> ApiResult<String> {
        let _serialized = self.refresh_lock.lock().await;
        match self.current_token() {
            None => Err(ApiError::NotAuthenticated),
            Some(current) if Some(current.as_str()) != failed_token => Ok(current),
            Some(_) => self.refresh().await.map(|c| c.access_token),
        }
    }

    /// Lifetime number of refresh exchanges attempted.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}
