//! Test doubles shared by the unit tests.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::StatusCode;

use crate::api::{ApiError, ApiRequest, ApiResponse, IdentityProvider, LoginGrant, RefreshGrant, Transport};
use crate::auth::{AuthError, Clock, CredentialPair, UserInfo};

/// Fixed "now" used across tests
pub const NOW: i64 = 1_700_000_000;

/// Unsigned JWT-shaped secret with the given claims.
pub fn jwt(subject: &str, role: Option<&str>, expires_at: i64) -> String {
    let payload = match role {
        Some(role) => serde_json::json!({"sub": subject, "role": role, "exp": expires_at}),
        None => serde_json::json!({"sub": subject, "exp": expires_at}),
    };
    jwt_from_payload(&payload.to_string())
}

pub fn jwt_from_payload(payload: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    format!("{}.{}.sig", header, URL_SAFE_NO_PAD.encode(payload))
}

pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
enum Outcome<T> {
    Ok(T),
    Rejected,
    Unreachable,
}

struct Login {
    identifier: String,
    secret: String,
    grant: LoginGrant,
}

/// Identity provider that answers from canned outcomes and counts calls.
pub struct FakeProvider {
    login: Option<Login>,
    login_unreachable: bool,
    refresh: Outcome<RefreshGrant>,
    refresh_delay: Option<Duration>,
    revoke_unreachable: bool,
    refresh_calls: AtomicUsize,
    refreshed_with: Mutex<Vec<String>>,
    revoked: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            login: None,
            login_unreachable: false,
            refresh: Outcome::Rejected,
            refresh_delay: None,
            revoke_unreachable: false,
            refresh_calls: AtomicUsize::new(0),
            refreshed_with: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
        }
    }

    pub fn with_login(
        mut self,
        identifier: &str,
        secret: &str,
        access: &str,
        refresh: &str,
        user_info: Option<UserInfo>,
    ) -> Self {
        self.login = Some(Login {
            identifier: identifier.to_string(),
            secret: secret.to_string(),
            grant: LoginGrant {
                credentials: CredentialPair::new(access, refresh),
                user_info,
            },
        });
        self
    }

    pub fn with_login_unreachable(mut self) -> Self {
        self.login_unreachable = true;
        self
    }

    pub fn with_refresh_ok(mut self, access: &str, rotated: Option<&str>) -> Self {
        self.refresh = Outcome::Ok(RefreshGrant {
            access: access.to_string(),
            refresh: rotated.map(str::to_string),
        });
        self
    }

    pub fn with_refresh_rejected(mut self) -> Self {
        self.refresh = Outcome::Rejected;
        self
    }

    pub fn with_refresh_unreachable(mut self) -> Self {
        self.refresh = Outcome::Unreachable;
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = Some(delay);
        self
    }

    pub fn with_revoke_unreachable(mut self) -> Self {
        self.revoke_unreachable = true;
        self
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn refreshed_with(&self) -> Vec<String> {
        self.refreshed_with.lock().unwrap().clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn login(&self, identifier: &str, secret: &str) -> Result<LoginGrant, AuthError> {
        if self.login_unreachable {
            return Err(AuthError::NetworkUnavailable("connection refused".into()));
        }
        match &self.login {
            Some(login) if login.identifier == identifier && login.secret == secret => {
                Ok(login.grant.clone())
            }
            _ => Err(AuthError::LoginRejected(
                "No active account found with the given credentials".into(),
            )),
        }
    }

    async fn refresh(&self, refresh_secret: &str) -> Result<RefreshGrant, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_with
            .lock()
            .unwrap()
            .push(refresh_secret.to_string());
        if let Some(delay) = self.refresh_delay {
            tokio::time::sleep(delay).await;
        }
        match &self.refresh {
            Outcome::Ok(grant) => Ok(grant.clone()),
            Outcome::Rejected => Err(AuthError::RefreshRejected("401: Token is invalid or expired".into())),
            Outcome::Unreachable => Err(AuthError::NetworkUnavailable("connection reset".into())),
        }
    }

    async fn revoke(&self, refresh_secret: &str) -> Result<(), AuthError> {
        if self.revoke_unreachable {
            return Err(AuthError::NetworkUnavailable("connection refused".into()));
        }
        self.revoked.lock().unwrap().push(refresh_secret.to_string());
        Ok(())
    }
}

/// Backend that accepts exactly one access secret. `/missing` is a 404;
/// every other path echoes itself back as JSON.
pub struct ScriptedTransport {
    accepted: String,
    seen: Mutex<Vec<Option<String>>>,
    bodies: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedTransport {
    pub fn accepting(secret: &str) -> Self {
        Self {
            accepted: secret.to_string(),
            seen: Mutex::new(Vec::new()),
            bodies: Mutex::new(Vec::new()),
        }
    }

    /// Access secrets presented, in call order
    pub fn seen(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        access_secret: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        self.seen
            .lock()
            .unwrap()
            .push(access_secret.map(str::to_string));
        if let Some(ref body) = request.body {
            self.bodies.lock().unwrap().push(body.clone());
        }

        if access_secret != Some(self.accepted.as_str()) {
            return Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"detail":"Given token not valid"}"#));
        }
        if request.path == "/missing" {
            return Ok(ApiResponse::new(StatusCode::NOT_FOUND, "Not found"));
        }
        Ok(ApiResponse::new(
            StatusCode::OK,
            serde_json::json!({"path": request.path}).to_string(),
        ))
    }
}
