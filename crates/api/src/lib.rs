//! Patron platform API client
//!
//! Everything the application asks of the backend goes through one
//! [`PlatformClient`], which routes each call through a [`RequestExecutor`]:
//! circuit breaker, response cache, request coalescing, a concurrency limit,
//! retries with backoff, and a single transparent credential refresh on 401.
//!
//! ## Layers
//!
//! - **[`Transport`]** - one network attempt. [`HttpTransport`] speaks HTTP via
//!   `reqwest` and unwraps the `{ success, data, error, timestamp }` envelope.
//! - **[`TokenManager`]** - current credential, expiry inspection, refresh,
//!   persistence through a [`CredentialStore`].
//! - **[`RequestExecutor`]** - composes the `resilience` primitives around the
//!   transport.
//! - **[`PlatformClient`]** - typed content, subscription, messaging,
//!   notification, user and settings operations, plus diagnostics.
//!
//! ## Quick example
//!
//! ```no_run
//! use api::{ApiConfig, ContentQuery, HttpTransport, MemoryCredentialStore, PlatformClient};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), api::ApiError> {
//!     let config = ApiConfig::default().with_base_url("https://patron.example/api");
//!     let transport = Arc::new(HttpTransport::new(&config.base_url, config.request_timeout)?);
//!     let client =
//!         PlatformClient::connect(config, transport, Arc::new(MemoryCredentialStore::new())).await?;
//!
//!     let page = client.get_content(&ContentQuery::page(1).with_category("music")).await?;
//!     println!("{} of {} items", page.items.len(), page.pagination.total);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod request;
pub mod token;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use crate::client::PlatformClient;
pub use crate::config::ApiConfig;
pub use crate::error::{ApiError, ApiResult, ErrorInfo};
pub use crate::executor::{ExecutorStats, RequestExecutor};
pub use crate::request::{ApiRequest, CachePolicy, Method};
pub use crate::token::{
    jwt_expiry, Credential, CredentialError, CredentialStore, FileCredentialStore,
    MemoryCredentialStore, TokenManager,
};
pub use crate::transport::{decode_envelope, HttpTransport, Transport};
pub use crate::types::{
    AuthSession, Content, ContentQuery, ContentUpdate, Envelope, LoginRequest, Message,
    NewContent, NewMessage, NewSubscription, Notification, PageQuery, Paginated, Pagination,
    ProfileUpdate, RegisterRequest, Settings, Subscription, SubscriptionStatus,
    SubscriptionUpdate, User, UserRole,
};
