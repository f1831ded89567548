//! Domain operations of the platform, all routed through one [`RequestExecutor`].

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use resilience::CircuitState;

use crate::config::ApiConfig;
use crate::error::ApiResult;
use crate::executor::{ExecutorStats, RequestExecutor};
use crate::request::{ApiRequest, CachePolicy};
use crate::token::CredentialStore;
use crate::transport::Transport;
use crate::types::{
    AuthSession, Content, ContentQuery, ContentUpdate, LoginRequest, Message, NewContent,
    NewMessage, NewSubscription, Notification, PageQuery, Paginated, ProfileUpdate,
    RegisterRequest, Settings, Subscription, SubscriptionUpdate, User,
};

const CONTENT: &[&str] = &["/content"];
const SUBSCRIPTIONS: &[&str] = &["/subscriptions", "/content"];
const MESSAGES: &[&str] = &["/messages"];
const NOTIFICATIONS: &[&str] = &["/notifications"];
const USERS: &[&str] = &["/users"];
const SETTINGS: &[&str] = &["/settings"];

const SEARCH_KEY: &str = "content-search";

/// The platform client. Cheap to share behind an `Arc`.
pub struct PlatformClient {
    executor: RequestExecutor,
}

impl PlatformClient {
    pub fn new(executor: RequestExecutor) -> Self {
        Self { executor }
    }

    /// Build a client and restore any persisted credential.
    pub async fn connect(
        config: ApiConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
    ) -> ApiResult<Self> {
        let executor = RequestExecutor::new(config, transport, store);
        executor.tokens().restore().await?;
        Ok(Self::new(executor))
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    fn cached(&self) -> CachePolicy {
        CachePolicy::Read {
            ttl: self.executor.config().cache.default_ttl,
        }
    }

    fn volatile(&self) -> CachePolicy {
        CachePolicy::Read {
            ttl: self.executor.config().volatile_ttl,
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        policy: CachePolicy,
    ) -> ApiResult<T> {
        self.executor.execute_as(request, policy).await
    }

    async fn call_unit(&self, request: ApiRequest, policy: CachePolicy) -> ApiResult<()> {
        self.executor.execute(request, policy).await.map(drop)
    }

    // --- auth ---

    pub async fn login(&self, credentials: &LoginRequest) -> ApiResult<AuthSession> {
        let request = ApiRequest::post("/auth/login")
            .anonymous()
            .json(credentials)?;
        let session: AuthSession = self.call(request, CachePolicy::Bypass).await?;
        self.adopt(&session).await?;
        info!(user_id = %session.user.id, "logged_in");
        Ok(session)
    }

    pub async fn register(&self, details: &RegisterRequest) -> ApiResult<AuthSession> {
        let request = ApiRequest::post("/auth/register")
            .anonymous()
            .json(details)?;
        let session: AuthSession = self.call(request, CachePolicy::Bypass).await?;
        self.adopt(&session).await?;
        info!(user_id = %session.user.id, "registered");
        Ok(session)
    }

    async fn adopt(&self, session: &AuthSession) -> ApiResult<()> {
        self.executor.tokens().set(session.credential()).await?;
        self.executor.clear_cache();
        Ok(())
    }

    /// Tell the backend, then forget the credential and every cached read.
    /// Local state is cleared even when the backend call fails.
    pub async fn logout(&self) -> ApiResult<()> {
        if self.executor.tokens().is_authenticated() {
            if let Err(err) = self
                .call_unit(ApiRequest::post("/auth/logout"), CachePolicy::Bypass)
                .await
            {
                warn!(error = %err, "logout_request_failed");
            }
        }
        self.executor.tokens().clear().await?;
        self.executor.clear_cache();
        info!("logged_out");
        Ok(())
    }

    pub async fn current_user(&self) -> ApiResult<User> {
        self.call(ApiRequest::get("/users/me"), self.cached()).await
    }

    // --- content ---

    pub async fn get_content(&self, query: &ContentQuery) -> ApiResult<Paginated<Content>> {
        let request = ApiRequest::get("/content").queries(query.to_query());
        self.call(request, self.cached()).await
    }

    pub async fn get_content_by_id(&self, id: &str) -> ApiResult<Content> {
        self.call(ApiRequest::get(format!("/content/{id}")), self.cached())
            .await
    }

    /// Search-as-you-type. Only the last call of a burst reaches the backend;
    /// the earlier ones fail with `ApiError::Superseded`.
    pub async fn search_content(&self, term: &str) -> ApiResult<Paginated<Content>> {
        let request = ApiRequest::get("/content")
            .queries(ContentQuery::default().with_search(term).to_query());
        let delay: Duration = self.executor.config().search_debounce;
        let value = self
            .executor
            .execute_debounced(SEARCH_KEY, delay, request, self.cached())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn create_content(&self, content: &NewContent) -> ApiResult<Content> {
        let request = ApiRequest::post("/content").json(content)?;
        self.call(request, CachePolicy::Invalidate(CONTENT)).await
    }

    pub async fn update_content(&self, id: &str, update: &ContentUpdate) -> ApiResult<Content> {
        let request = ApiRequest::put(format!("/content/{id}")).json(update)?;
        self.call(request, CachePolicy::Invalidate(CONTENT)).await
    }

    pub async fn delete_content(&self, id: &str) -> ApiResult<()> {
        self.call_unit(
            ApiRequest::delete(format!("/content/{id}")),
            CachePolicy::Invalidate(CONTENT),
        )
        .await
    }

    // --- subscriptions ---

    pub async fn get_subscriptions(&self, page: PageQuery) -> ApiResult<Paginated<Subscription>> {
        let request = ApiRequest::get("/subscriptions").queries(page.to_query());
        self.call(request, self.cached()).await
    }

    pub async fn subscribe(&self, subscription: &NewSubscription) -> ApiResult<Subscription> {
        let request = ApiRequest::post("/subscriptions").json(subscription)?;
        self.call(request, CachePolicy::Invalidate(SUBSCRIPTIONS))
            .await
    }

    pub async fn update_subscription(
        &self,
        id: &str,
        update: &SubscriptionUpdate,
    ) -> ApiResult<Subscription> {
        let request = ApiRequest::patch(format!("/subscriptions/{id}")).json(update)?;
        self.call(request, CachePolicy::Invalidate(SUBSCRIPTIONS))
            .await
    }

    pub async fn cancel_subscription(&self, id: &str) -> ApiResult<()> {
        self.call_unit(
            ApiRequest::delete(format!("/subscriptions/{id}")),
            CachePolicy::Invalidate(SUBSCRIPTIONS),
        )
        .await
    }

    // --- messages ---

    /// Inbox page, optionally narrowed to the conversation with one user.
    pub async fn get_messages(
        &self,
        page: PageQuery,
        with_user: Option<&str>,
    ) -> ApiResult<Paginated<Message>> {
        let mut request = ApiRequest::get("/messages").queries(page.to_query());
        if let Some(user_id) = with_user {
            request = request.query("with", user_id);
        }
        self.call(request, self.volatile()).await
    }

    pub async fn send_message(&self, message: &NewMessage) -> ApiResult<Message> {
        let request = ApiRequest::post("/messages").json(message)?;
        self.call(request, CachePolicy::Invalidate(MESSAGES)).await
    }

    pub async fn mark_message_read(&self, id: &str) -> ApiResult<()> {
        self.call_unit(
            ApiRequest::patch(format!("/messages/{id}/read")),
            CachePolicy::Invalidate(MESSAGES),
        )
        .await
    }

    pub async fn delete_message(&self, id: &str) -> ApiResult<()> {
        self.call_unit(
            ApiRequest::delete(format!("/messages/{id}")),
            CachePolicy::Invalidate(MESSAGES),
        )
        .await
    }

    // --- notifications ---

    pub async fn get_notifications(&self, page: PageQuery) -> ApiResult<Paginated<Notification>> {
        let request = ApiRequest::get("/notifications").queries(page.to_query());
        self.call(request, self.volatile()).await
    }

    pub async fn mark_notification_read(&self, id: &str) -> ApiResult<()> {
        self.call_unit(
            ApiRequest::patch(format!("/notifications/{id}/read")),
            CachePolicy::Invalidate(NOTIFICATIONS),
        )
        .await
    }

    pub async fn mark_all_notifications_read(&self) -> ApiResult<()> {
        self.call_unit(
            ApiRequest::patch("/notifications/read-all"),
            CachePolicy::Invalidate(NOTIFICATIONS),
        )
        .await
    }

    pub async fn delete_notification(&self, id: &str) -> ApiResult<()> {
        self.call_unit(
            ApiRequest::delete(format!("/notifications/{id}")),
            CachePolicy::Invalidate(NOTIFICATIONS),
        )
        .await
    }

    // --- users & settings ---

    pub async fn get_user(&self, id: &str) -> ApiResult<User> {
        self.call(ApiRequest::get(format!("/users/{id}")), self.cached())
            .await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> ApiResult<User> {
        let request = ApiRequest::patch("/users/me").json(update)?;
        self.call(request, CachePolicy::Invalidate(USERS)).await
    }

    pub async fn get_settings(&self) -> ApiResult<Settings> {
        self.call(ApiRequest::get("/settings"), self.cached()).await
    }

    pub async fn update_settings(&self, settings: &Settings) -> ApiResult<Settings> {
        let request = ApiRequest::put("/settings").json(settings)?;
        self.call(request, CachePolicy::Invalidate(SETTINGS)).await
    }

    // --- diagnostics ---

    pub fn cache_size(&self) -> usize {
        self.executor.cache_size()
    }

    pub fn active_requests(&self) -> usize {
        self.executor.active_requests()
    }

    pub fn queued_requests(&self) -> usize {
        self.executor.queued_requests()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.executor.circuit_state()
    }

    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    pub fn clear_cache(&self) {
        self.executor.clear_cache();
    }

    pub fn reset_circuit_breaker(&self) {
        self.executor.reset_circuit_breaker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::testing::{status, ScriptedTransport};
    use crate::token::{Credential, MemoryCredentialStore};
    use serde_json::{json, Value};

    fn user(id: &str) -> Value {
        json!({ "id": id, "email": format!("{id}@patron.test"), "username": id, "role": "creator" })
    }

    fn content(id: &str) -> Value {
        json!({ "id": id, "creatorId": "u1", "title": format!("post {id}") })
    }

    fn page(items: Vec<Value>) -> Value {
        let total = items.len();
        json!({ "items": items, "pagination": { "page": 1, "limit": 20, "total": total, "pages": 1 } })
    }

    async fn client(transport: &Arc<ScriptedTransport>) -> PlatformClient {
        PlatformClient::connect(
            ApiConfig::default(),
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(MemoryCredentialStore::with_credential(Credential::new("a1", "r1"))),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn connect_restores_persisted_credential() {
        let transport = Arc::new(ScriptedTransport::new(|_, token, _| {
            assert_eq!(token, Some("a1"));
            Ok(user("u1"))
        }));
        let client = client(&transport).await;
        assert_eq!(client.current_user().await.unwrap().id, "u1");
    }

    #[tokio::test]
    async fn content_listing_is_cached_until_a_create() {
        let transport = Arc::new(ScriptedTransport::new(|request, _, n| {
            match (request.method.as_str(), request.path.as_str()) {
                ("GET", "/content") => Ok(page(vec![content(&format!("c{n}"))])),
                ("POST", "/content") => Ok(content("new")),
                other => panic!("unexpected call {other:?}"),
            }
        }));
        let client = client(&transport).await;
        let query = ContentQuery::page(1).with_category("music");

        let first = client.get_content(&query).await.unwrap();
        let second = client.get_content(&query).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.calls(), 1);

        let created = client
            .create_content(&NewContent {
                title: "post new".into(),
                description: None,
                category: Some("music".into()),
                media_url: None,
                is_premium: false,
                price: None,
            })
            .await
            .unwrap();
        assert_eq!(created.id, "new");
        assert_eq!(client.cache_size(), 0);

        let third = client.get_content(&query).await.unwrap();
        assert_eq!(third.items[0].id, "c2");
        assert_eq!(transport.calls(), 3);
        assert_eq!(
            transport.sent()[0].0,
            "/content?category=music&limit=20&page=1"
        );
    }

    #[tokio::test]
    async fn login_persists_session_credential_and_drops_cache() {
        let transport = Arc::new(ScriptedTransport::new(|request, token, _| {
            match request.path.as_str() {
                "/auth/login" => {
                    assert!(token.is_none());
                    assert_eq!(
                        request.body,
                        Some(json!({ "email": "fan@patron.test", "password": "hunter2" }))
                    );
                    Ok(json!({
                        "user": user("u9"),
                        "accessToken": "fresh-access",
                        "refreshToken": "fresh-refresh"
                    }))
                }
                "/settings" => Ok(json!({ "theme": "dark" })),
                other => panic!("unexpected path {other}"),
            }
        }));
        let client = client(&transport).await;
        client.get_settings().await.unwrap();
        assert_eq!(client.cache_size(), 1);

        let session = client
            .login(&LoginRequest {
                email: "fan@patron.test".into(),
                password: "hunter2".into(),
            })
            .await
            .unwrap();
        assert_eq!(session.user.id, "u9");
        assert_eq!(
            client.executor().tokens().current_token().as_deref(),
            Some("fresh-access")
        );
        assert_eq!(client.cache_size(), 0);
    }

    #[tokio::test]
    async fn logout_clears_local_state_even_if_backend_fails() {
        let transport = Arc::new(ScriptedTransport::new(|_, _, _| {
            Err(status(500, "logout broke"))
        }));
        let client = PlatformClient::connect(
            ApiConfig::default().with_retry(resilience::RetryConfig::default().with_max_retries(0)),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(MemoryCredentialStore::with_credential(Credential::new("a1", "r1"))),
        )
        .await
        .unwrap();

        client.logout().await.unwrap();
        assert!(!client.executor().tokens().is_authenticated());
        assert_eq!(transport.calls(), 1);

        // A second logout has nothing to tell the backend.
        client.logout().await.unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn subscribing_invalidates_subscriptions_and_content() {
        let transport = Arc::new(ScriptedTransport::new(|request, _, _| {
            match (request.method.as_str(), request.path.as_str()) {
                ("GET", "/subscriptions") => Ok(page(vec![])),
                ("GET", "/content/c1") => Ok(content("c1")),
                ("GET", "/settings") => Ok(json!({})),
                ("POST", "/subscriptions") => Ok(json!({
                    "id": "s1",
                    "subscriberId": "u1",
                    "creatorId": "u2",
                    "status": "active",
                    "autoRenew": true
                })),
                other => panic!("unexpected call {other:?}"),
            }
        }));
        let client = client(&transport).await;
        client.get_subscriptions(PageQuery::default()).await.unwrap();
        client.get_content_by_id("c1").await.unwrap();
        client.get_settings().await.unwrap();
        assert_eq!(client.cache_size(), 3);

        let sub = client
            .subscribe(&NewSubscription {
                creator_id: "u2".into(),
                tier: None,
                auto_renew: true,
            })
            .await
            .unwrap();
        assert!(sub.auto_renew);
        assert_eq!(client.cache_size(), 1);
    }

    #[tokio::test]
    async fn message_and_notification_mutations_hit_expected_routes() {
        let transport = Arc::new(ScriptedTransport::new(|request, _, _| {
            match (request.method.as_str(), request.path.as_str()) {
                ("POST", "/messages") => Ok(json!({
                    "id": "m1",
                    "senderId": "u1",
                    "recipientId": "u2",
                    "content": "hi"
                })),
                _ => Ok(Value::Null),
            }
        }));
        let client = client(&transport).await;

        let sent = client
            .send_message(&NewMessage {
                recipient_id: "u2".into(),
                content: "hi".into(),
            })
            .await
            .unwrap();
        assert_eq!(sent.id, "m1");
        client.mark_message_read("m1").await.unwrap();
        client.delete_message("m1").await.unwrap();
        client.mark_notification_read("n1").await.unwrap();
        client.mark_all_notifications_read().await.unwrap();
        client.delete_notification("n1").await.unwrap();
        client.cancel_subscription("s1").await.unwrap();
        client.delete_content("c1").await.unwrap();

        let paths: Vec<String> = transport.sent().into_iter().map(|(path, _)| path).collect();
        assert_eq!(
            paths,
            vec![
                "/messages",
                "/messages/m1/read",
                "/messages/m1",
                "/notifications/n1/read",
                "/notifications/read-all",
                "/notifications/n1",
                "/subscriptions/s1",
                "/content/c1",
            ]
        );
    }

    #[tokio::test]
    async fn conversation_filter_is_sent_as_query() {
        let transport = Arc::new(ScriptedTransport::new(|_, _, _| Ok(page(vec![]))));
        let client = client(&transport).await;
        client
            .get_messages(PageQuery::new(2, 50), Some("u7"))
            .await
            .unwrap();
        assert_eq!(transport.sent()[0].0, "/messages?limit=50&page=2&with=u7");
    }

    #[tokio::test(start_paused = true)]
    async fn search_sends_only_the_settled_term() {
        let transport = Arc::new(ScriptedTransport::new(|request, _, _| {
            let term = request.query.get("search").cloned().unwrap_or_default();
            Ok(page(vec![content(&term)]))
        }));
        let client = Arc::new(client(&transport).await);

        let early = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.search_content("jaz").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = client.search_content("jazz").await.unwrap();

        assert!(matches!(early.await.unwrap(), Err(ApiError::Superseded(_))));
        assert_eq!(settled.items[0].id, "jazz");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn not_found_carries_backend_detail() {
        let transport = Arc::new(ScriptedTransport::new(|_, _, _| {
            Err(ApiError::from_status(
                404,
                crate::error::ErrorInfo::new("User not found").with_code("USER_NOT_FOUND"),
            ))
        }));
        let client = client(&transport).await;
        let err = client.get_user("ghost").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(
            err.info().and_then(|info| info.code.as_deref()),
            Some("USER_NOT_FOUND")
        );
    }
}
