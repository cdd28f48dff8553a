//! Authenticated access to the backend.
//!
//! `AuthenticatedClient` wraps every outbound call: it attaches the current
//! access secret and, when the backend answers 401, runs one refresh and
//! reissues the request. Each call gets a retry budget of exactly one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::SessionManager;
use crate::config::Config;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

// ============================================================================
// Request / response values
// ============================================================================

/// A backend call, described without any credentials attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    pub fn post<B: Serialize>(path: impl Into<String>, body: &B) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        Ok(Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Sends a single request. Non-success statuses come back as `Ok` so the
/// interceptor can see them; only transport failures are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_secret: Option<&str>,
    ) -> Result<ApiResponse, ApiError>;
}

/// reqwest transport with bearer auth and 429 backoff.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn auth_headers(access_secret: Option<&str>) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(secret) = access_secret {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", secret))
                .map_err(|_| ApiError::InvalidResponse("Access secret is not a valid header value".into()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_secret: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(Self::auth_headers(access_secret)?);
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = %url, retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await?;
            return Ok(ApiResponse { status, body });
        }
    }
}

// ============================================================================
// Interceptor
// ============================================================================

/// Request-scoped retry allowance. Lives on the stack of one `send` call so
/// the shared request value is never mutated.
#[derive(Debug)]
struct RetryBudget {
    remaining: u8,
}

impl RetryBudget {
    fn single() -> Self {
        Self { remaining: 1 }
    }

    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Backend client that recovers from expired access secrets.
/// Clone is cheap - the session and transport are shared.
#[derive(Clone)]
pub struct AuthenticatedClient {
    session: SessionManager,
    transport: Arc<dyn Transport>,
}

impl AuthenticatedClient {
    pub fn new(session: SessionManager, transport: Arc<dyn Transport>) -> Self {
        Self { session, transport }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send a request, refreshing and retrying once on 401.
    ///
    /// A second 401, or a refresh that fails, surfaces as
    /// `ApiError::Unauthorized`; by then the session is already logged out.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut budget = RetryBudget::single();

        loop {
            let access = self.session.access_secret();
            let response = self.transport.execute(&request, access.as_deref()).await?;

            if response.status.is_success() {
                return Ok(response);
            }
            if response.status != StatusCode::UNAUTHORIZED {
                return Err(ApiError::from_status(response.status, &response.body));
            }

            if !budget.take() {
                warn!(path = %request.path, "Still unauthorized after refresh");
                return Err(ApiError::Unauthorized);
            }

            // A refresh that finished while this request was in flight already
            // replaced the secret it was sent with.
            let current = self.session.access_secret();
            if current.is_some() && current != access {
                debug!(path = %request.path, "Credentials changed since request was sent, retrying");
                continue;
            }

            debug!(path = %request.path, "Unauthorized, refreshing credentials");
            if !self.session.refresh().await {
                return Err(ApiError::Unauthorized);
            }
            debug!(path = %request.path, "Retrying with refreshed credentials");
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path, body)?).await?.json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialPair, CredentialStore, MemoryStore};
    use crate::testing::{jwt, FakeProvider, ManualClock, ScriptedTransport, NOW};

    struct Fixture {
        client: AuthenticatedClient,
        store: Arc<MemoryStore>,
        provider: Arc<FakeProvider>,
        transport: Arc<ScriptedTransport>,
        stale: String,
        renewed: String,
    }

    fn fixture(provider: FakeProvider, renewed: String) -> Fixture {
        let stale = jwt("alice", Some("member"), NOW - 1);
        let refresh = jwt("alice", None, NOW + 3600);
        let store = Arc::new(MemoryStore::with_pair(CredentialPair::new(&stale, refresh)));
        let provider = Arc::new(provider);
        let transport = Arc::new(ScriptedTransport::accepting(&renewed));
        let session = SessionManager::new(
            store.clone(),
            provider.clone(),
            Arc::new(ManualClock::new(NOW)),
        );
        Fixture {
            client: AuthenticatedClient::new(session, transport.clone()),
            store,
            provider,
            transport,
            stale,
            renewed,
        }
    }

    fn refreshing_fixture() -> Fixture {
        let renewed = jwt("alice", Some("member"), NOW + 300);
        fixture(FakeProvider::new().with_refresh_ok(&renewed, None), renewed)
    }

    #[tokio::test]
    async fn test_valid_secret_passes_straight_through() {
        let f = refreshing_fixture();
        f.store
            .save(&CredentialPair::new(&f.renewed, "R1"))
            .unwrap();

        let response = f.client.send(ApiRequest::get("/profile")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(f.provider.refresh_calls(), 0);
        assert_eq!(f.transport.seen(), vec![Some(f.renewed.clone())]);
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_and_retries_with_new_secret() {
        let f = refreshing_fixture();

        let response = f.client.send(ApiRequest::get("/profile")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, r#"{"path":"/profile"}"#);
        assert_eq!(f.provider.refresh_calls(), 1);
        assert_eq!(
            f.transport.seen(),
            vec![Some(f.stale.clone()), Some(f.renewed.clone())]
        );
    }

    /// Installs `renewed` in the store while rejecting the first request, as
    /// if another caller's refresh completed in the meantime.
    struct SwappingTransport {
        store: Arc<MemoryStore>,
        renewed: String,
        backend: ScriptedTransport,
    }

    #[async_trait]
    impl Transport for SwappingTransport {
        async fn execute(
            &self,
            request: &ApiRequest,
            access_secret: Option<&str>,
        ) -> Result<ApiResponse, ApiError> {
            if access_secret != Some(self.renewed.as_str()) {
                let refresh = jwt("alice", None, NOW + 3600);
                self.store
                    .save(&CredentialPair::new(&self.renewed, refresh))
                    .unwrap();
            }
            self.backend.execute(request, access_secret).await
        }
    }

    #[tokio::test]
    async fn test_late_unauthorized_retries_with_replaced_secret() {
        let f = refreshing_fixture();
        let transport = Arc::new(SwappingTransport {
            store: f.store.clone(),
            renewed: f.renewed.clone(),
            backend: ScriptedTransport::accepting(&f.renewed),
        });
        let client = AuthenticatedClient::new(f.client.session().clone(), transport.clone());

        let response = client.send(ApiRequest::get("/profile")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(f.provider.refresh_calls(), 0);
        assert_eq!(
            transport.backend.seen(),
            vec![Some(f.stale.clone()), Some(f.renewed.clone())]
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_propagates_unauthorized() {
        let renewed = jwt("alice", None, NOW + 300);
        let f = fixture(FakeProvider::new().with_refresh_rejected(), renewed);

        let err = f.client.send(ApiRequest::get("/profile")).await.unwrap_err();

        assert!(err.requires_login());
        assert_eq!(f.transport.seen().len(), 1);
        assert!(f.store.load().is_none());
        assert!(f.client.session().current_user().is_none());
    }

    #[tokio::test]
    async fn test_retry_budget_is_one() {
        // Refresh "succeeds" but the backend still rejects the new secret
        let renewed = jwt("alice", None, NOW + 300);
        let f = fixture(
            FakeProvider::new().with_refresh_ok(&renewed, None),
            "never-accepted".to_string(),
        );

        let err = f.client.send(ApiRequest::get("/profile")).await.unwrap_err();

        assert!(matches!(err, ApiError::Unauthorized));
        assert_eq!(f.provider.refresh_calls(), 1);
        assert_eq!(f.transport.seen().len(), 2);
    }

    #[tokio::test]
    async fn test_other_statuses_are_not_retried() {
        let f = refreshing_fixture();
        f.store
            .save(&CredentialPair::new(&f.renewed, "R1"))
            .unwrap();

        let err = f.client.send(ApiRequest::get("/missing")).await.unwrap_err();

        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(f.provider.refresh_calls(), 0);
        assert_eq!(f.transport.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_no_credentials_means_no_refresh_network_call() {
        let f = refreshing_fixture();
        f.store.clear().unwrap();

        let err = f.client.send(ApiRequest::get("/profile")).await.unwrap_err();

        assert!(matches!(err, ApiError::Unauthorized));
        assert_eq!(f.provider.refresh_calls(), 0);
        assert_eq!(f.transport.seen(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_unauthorized_requests_share_one_refresh() {
        let renewed = jwt("alice", None, NOW + 300);
        let f = fixture(
            FakeProvider::new()
                .with_refresh_ok(&renewed, None)
                .with_refresh_delay(Duration::from_millis(50)),
            renewed,
        );

        let paths: Vec<String> = (0..6).map(|i| format!("/announcements/{}", i)).collect();
        let results = futures::future::join_all(
            paths.iter().map(|p| f.client.send(ApiRequest::get(p.as_str()))),
        )
        .await;

        assert_eq!(f.provider.refresh_calls(), 1);
        for (path, result) in paths.iter().zip(results) {
            let response = result.unwrap();
            assert_eq!(response.body, format!(r#"{{"path":"{}"}}"#, path));
        }
        let retried_with_new = f
            .transport
            .seen()
            .iter()
            .filter(|s| s.as_deref() == Some(f.renewed.as_str()))
            .count();
        assert_eq!(retried_with_new, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_gets_unauthorized_when_refresh_fails() {
        let renewed = jwt("alice", None, NOW + 300);
        let f = fixture(
            FakeProvider::new()
                .with_refresh_rejected()
                .with_refresh_delay(Duration::from_millis(50)),
            renewed,
        );

        let (first, queued) = tokio::join!(
            f.client.send(ApiRequest::get("/members")),
            f.client.send(ApiRequest::get("/announcements")),
        );

        assert!(matches!(first, Err(ApiError::Unauthorized)));
        assert!(matches!(queued, Err(ApiError::Unauthorized)));
        assert_eq!(f.provider.refresh_calls(), 1);
        assert_eq!(f.transport.seen().len(), 2);
        assert!(f.client.session().current_user().is_none());
    }

    #[tokio::test]
    async fn test_get_json_and_post_json() {
        let f = refreshing_fixture();

        let value: serde_json::Value = f.client.get_json("/users").await.unwrap();
        assert_eq!(value["path"], "/users");

        let value: serde_json::Value = f
            .client
            .post_json("/announcements", &serde_json::json!({"title": "hi"}))
            .await
            .unwrap();
        assert_eq!(value["path"], "/announcements");
        assert_eq!(f.transport.bodies().last().unwrap()["title"], "hi");
    }

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::single();
        assert!(budget.take());
        assert!(!budget.take());
        assert!(!budget.take());
    }

    #[test]
    fn test_transport_url_building() {
        let config = Config {
            base_url: "https://api.example.com/".to_string(),
            ..Config::default()
        };
        let transport = HttpTransport::with_client(Client::new(), &config);
        assert_eq!(transport.url("/profile"), "https://api.example.com/profile");
        assert_eq!(transport.url("profile"), "https://api.example.com/profile");
        assert_eq!(transport.url("https://other.example.com/x"), "https://other.example.com/x");
    }

    #[test]
    fn test_auth_headers() {
        let headers = HttpTransport::auth_headers(Some("abc")).unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer abc");

        let anonymous = HttpTransport::auth_headers(None).unwrap();
        assert!(anonymous.get(header::AUTHORIZATION).is_none());

        assert!(HttpTransport::auth_headers(Some("bad\nvalue")).is_err());
    }
}
