use std::sync::atomic::AtomicU64;
use std::sync::{Arc, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::refresh::InFlight;
use super::token::{self, Claims, Role};
use super::{AuthError, Clock, CredentialPair, CredentialStore};
use crate::api::IdentityProvider;

/// The signed-in user as the presentation layer sees it.
///
/// Built from decoded access-secret claims, or at login from the provider's
/// user info with the claims filling any gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    pub expires_at: Option<i64>,
}

impl Identity {
    /// Identity for a fresh login. Server-supplied user info wins; the decoded
    /// access secret fills gaps; the login identifier is the last resort.
    pub fn from_login(identifier: &str, access: &str, user_info: Option<&UserInfo>) -> Self {
        let claims = token::decode(access).ok();
        let subject = user_info
            .and_then(|u| u.subject.clone())
            .or_else(|| claims.as_ref().map(|c| c.subject.clone()))
            .unwrap_or_else(|| identifier.to_string());
        let role = user_info
            .and_then(|u| u.role)
            .or_else(|| claims.as_ref().map(|c| c.role))
            .unwrap_or_default();

        Self {
            subject,
            role,
            expires_at: claims.map(|c| c.expires_at),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn expiry_time(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.subject,
            role: claims.role,
            expires_at: Some(claims.expires_at),
        }
    }
}

/// User details returned alongside a login grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    #[serde(default, alias = "id", alias = "email")]
    pub subject: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionState {
    pub user: Option<Identity>,
    /// True only until the first `bootstrap` resolves
    pub loading: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            user: None,
            loading: true,
        }
    }
}

pub(super) struct Inner {
    pub(super) store: Arc<dyn CredentialStore>,
    pub(super) provider: Arc<dyn IdentityProvider>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) leeway_secs: i64,
    pub(super) state: watch::Sender<SessionState>,
    pub(super) in_flight: Mutex<Option<InFlight>>,
    pub(super) next_cycle: AtomicU64,
    /// Bumped by every login and logout. Guards stored credentials and the
    /// published user against a refresh that started in an older session.
    pub(super) generation: std::sync::Mutex<u64>,
}

/// Process-wide session context.
///
/// Cloning is cheap and every clone observes and mutates the same session.
/// Only this type writes credentials: through `establish`, `logout` and the
/// refresh orchestrator.
#[derive(Clone)]
pub struct SessionManager {
    pub(super) inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                clock,
                leeway_secs: 0,
                state,
                in_flight: Mutex::new(None),
                next_cycle: AtomicU64::new(0),
                generation: std::sync::Mutex::new(0),
            }),
        }
    }

    /// Treat access secrets as stale this many seconds before they expire.
    /// Must be called before the manager is cloned or shared.
    pub fn with_expiry_leeway(mut self, leeway_secs: i64) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.leeway_secs = leeway_secs.max(0),
            None => warn!("Session already shared, ignoring expiry leeway"),
        }
        self
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<Identity> {
        self.inner.state.borrow().user.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    /// Current access secret, read from the store on every call.
    pub fn access_secret(&self) -> Option<String> {
        self.inner.store.load().map(|pair| pair.access)
    }

    pub(super) fn now(&self) -> i64 {
        self.inner.clock.now()
    }

    /// Lock the session generation. Hold the guard across any credential
    /// write that must not interleave with login or logout.
    pub(super) fn lock_generation(&self) -> MutexGuard<'_, u64> {
        self.inner
            .generation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn set_user(&self, user: Option<Identity>) {
        self.inner.state.send_if_modified(|state| {
            if state.user == user {
                return false;
            }
            state.user = user;
            true
        });
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Seed the session from stored credentials.
    ///
    /// Valid access secrets are decoded directly; stale ones go through the
    /// refresh orchestrator. `loading` is cleared when this returns,
    /// whatever the outcome.
    pub async fn bootstrap(&self) {
        match self.inner.store.load() {
            None => {
                debug!("No stored credentials");
                self.set_user(None);
            }
            Some(pair) => {
                let now = self.now();
                let fresh = !token::expires_within(&pair.access, now, self.inner.leeway_secs);
                match token::decode(&pair.access) {
                    Ok(claims) if fresh => {
                        debug!(subject = %claims.subject, "Restored session from stored access secret");
                        self.set_user(Some(claims.into()));
                    }
                    _ => {
                        info!("Stored access secret is stale, refreshing");
                        if !self.refresh().await {
                            debug!("Bootstrap refresh failed, session cleared");
                        }
                    }
                }
            }
        }

        self.inner.state.send_if_modified(|state| {
            let was_loading = state.loading;
            state.loading = false;
            was_loading
        });
    }

    /// Sign in against the identity provider and establish the session.
    ///
    /// Failures are returned to the caller. A failed login never clears an
    /// existing session.
    pub async fn login(&self, identifier: &str, secret: &str) -> Result<Identity, AuthError> {
        info!(identifier, "Signing in");
        let grant = self.inner.provider.login(identifier, secret).await?;
        self.establish(
            identifier,
            grant.credentials.access,
            grant.credentials.refresh,
            grant.user_info,
        )
    }

    /// Persist a freshly issued pair and publish the user. No expiry check:
    /// the secrets were just issued.
    pub fn establish(
        &self,
        identifier: &str,
        access: String,
        refresh: String,
        user_info: Option<UserInfo>,
    ) -> Result<Identity, AuthError> {
        let identity = Identity::from_login(identifier, &access, user_info.as_ref());
        let mut generation = self.lock_generation();
        self.inner.store.save(&CredentialPair { access, refresh })?;
        *generation += 1;
        self.set_user(Some(identity.clone()));
        drop(generation);
        info!(subject = %identity.subject, role = %identity.role, "Session established");
        Ok(identity)
    }

    /// Drop credentials and the current user. Idempotent.
    pub fn logout(&self) {
        let mut generation = self.lock_generation();
        self.clear_session(&mut generation);
    }

    /// Log out only if no login or logout happened since `generation` was
    /// observed. Returns whether the session was cleared.
    pub(super) fn logout_if_current(&self, observed: u64) -> bool {
        let mut generation = self.lock_generation();
        if *generation != observed {
            return false;
        }
        self.clear_session(&mut generation);
        true
    }

    fn clear_session(&self, generation: &mut u64) {
        *generation += 1;
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored credentials");
        }
        let was_signed_in = self.inner.state.send_if_modified(|state| {
            let had_user = state.user.is_some();
            state.user = None;
            had_user
        });
        if was_signed_in {
            info!("Logged out");
        }
    }

    /// Revoke the refresh secret with the provider, then log out locally.
    /// Revocation is best effort: the local session is cleared regardless.
    pub async fn sign_out(&self) {
        if let Some(pair) = self.inner.store.load() {
            if let Err(e) = self.inner.provider.revoke(&pair.refresh).await {
                warn!(error = %e, "Failed to revoke refresh secret");
            }
        }
        self.logout();
    }

    /// Refresh ahead of time if the access secret is expired or about to be.
    pub async fn ensure_fresh(&self) -> bool {
        match self.inner.store.load() {
            None => false,
            Some(pair) if token::expires_within(&pair.access, self.now(), self.inner.leeway_secs) => {
                debug!("Access secret expiring, refreshing ahead of time");
                self.refresh().await
            }
            Some(_) => true,
        }
    }
}
