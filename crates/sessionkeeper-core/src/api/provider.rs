//! Client for the identity provider's login, refresh and logout endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{AuthError, CredentialPair, UserInfo};
use crate::config::Config;

/// Secrets and user details issued by a successful login.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub credentials: CredentialPair,
    pub user_info: Option<UserInfo>,
}

/// Result of a successful refresh. `refresh` is set when the provider
/// rotates refresh secrets on use.
#[derive(Clone)]
pub struct RefreshGrant {
    pub access: String,
    pub refresh: Option<String>,
}

/// The two (plus logout) endpoints the session core depends on.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn login(&self, identifier: &str, secret: &str) -> Result<LoginGrant, AuthError>;

    async fn refresh(&self, refresh_secret: &str) -> Result<RefreshGrant, AuthError>;

    /// Invalidate a refresh secret server-side
    async fn revoke(&self, refresh_secret: &str) -> Result<(), AuthError>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access: String,
    refresh: String,
    #[serde(default, alias = "userInfo", alias = "user_info")]
    user: Option<UserInfo>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// Pull a human-readable message out of an error payload.
///
/// Providers answer with `{"detail": ...}`, `{"error": ...}` or
/// `{"message": ...}`; anything else falls back to the raw (truncated) body.
pub(crate) fn error_detail(body: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(serde_json::Value::String(detail)) = map.get(key) {
                return detail.clone();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no details provided".to_string()
    } else {
        ApiError::truncate_body(trimmed)
    }
}

/// reqwest-backed identity provider.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
    login_path: String,
    refresh_path: String,
    logout_path: String,
}

impl HttpIdentityProvider {
    pub fn new(config: &Config) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| AuthError::NetworkUnavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, config))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            login_path: config.login_path.clone(),
            refresh_path: config.refresh_path.clone(),
            logout_path: config.logout_path.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn login(&self, identifier: &str, secret: &str) -> Result<LoginGrant, AuthError> {
        let url = self.url(&self.login_path);
        let response = self
            .client
            .post(&url)
            .json(&LoginRequest {
                email: identifier,
                password: secret,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "Login rejected");
            return Err(AuthError::LoginRejected(error_detail(&body)));
        }

        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;
        debug!(has_user_info = parsed.user.is_some(), "Login accepted");

        Ok(LoginGrant {
            credentials: CredentialPair {
                access: parsed.access,
                refresh: parsed.refresh,
            },
            user_info: parsed.user,
        })
    }

    async fn refresh(&self, refresh_secret: &str) -> Result<RefreshGrant, AuthError> {
        let url = self.url(&self.refresh_path);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest {
                refresh: refresh_secret,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshRejected(format!(
                "{}: {}",
                status,
                error_detail(&body)
            )));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))?;
        debug!(rotated = parsed.refresh.is_some(), "Refresh accepted");

        Ok(RefreshGrant {
            access: parsed.access,
            refresh: parsed.refresh,
        })
    }

    async fn revoke(&self, refresh_secret: &str) -> Result<(), AuthError> {
        let url = self.url(&self.logout_path);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest {
                refresh: refresh_secret,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("Refresh secret revoked");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(AuthError::InvalidResponse(format!(
                "Logout returned {}: {}",
                status,
                error_detail(&body)
            )))
        }
    }
}
