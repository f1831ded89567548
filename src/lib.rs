//! Workspace umbrella crate for the Patron client.
//!
//! Re-exports the resilience primitives and the API client, and provides the
//! composition root: [`build_client`] turns a [`PatronConfig`] into a ready
//! [`PlatformClient`] with its transport and credential store wired up.

pub mod config;

pub use api::{
    ApiConfig, ApiError, ApiRequest, ApiResult, AuthSession, CachePolicy, Content, ContentQuery,
    ContentUpdate, Credential, CredentialStore, ErrorInfo, ExecutorStats, FileCredentialStore,
    HttpTransport, LoginRequest, MemoryCredentialStore, Message, NewContent, NewMessage,
    NewSubscription, Notification, PageQuery, Paginated, Pagination, PlatformClient,
    ProfileUpdate, RegisterRequest, RequestExecutor, Settings, Subscription, SubscriptionUpdate,
    TokenManager, Transport, User,
};
pub use config::{
    ConfigLoadError, CredentialsConfig, ENV_API_URL, ENV_LOG_LEVEL, LoggingConfig, PatronConfig,
};
pub use resilience::{CircuitState, Superseded};

use std::sync::Arc;
use tracing::info;

/// Build the client against the real backend described by `config`.
///
/// Uses [`HttpTransport`] and a [`FileCredentialStore`] when
/// `credentials.path` is set, otherwise an in-memory store.
pub async fn build_client(config: &PatronConfig) -> ApiResult<PlatformClient> {
    let transport = Arc::new(HttpTransport::new(
        config.api.base_url.as_str(),
        config.api.request_timeout,
    )?);
    let store: Arc<dyn CredentialStore> = match &config.credentials.path {
        Some(path) => Arc::new(FileCredentialStore::new(path)),
        None => Arc::new(MemoryCredentialStore::new()),
    };
    build_client_with(config, transport, store).await
}

/// Build the client over caller-supplied transport and credential store.
pub async fn build_client_with(
    config: &PatronConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
) -> ApiResult<PlatformClient> {
    let client = PlatformClient::connect(config.api.clone(), transport, store).await?;
    info!(
        base_url = %config.api.base_url,
        authenticated = client.executor().tokens().is_authenticated(),
        "client_ready"
    );
    Ok(client)
}
