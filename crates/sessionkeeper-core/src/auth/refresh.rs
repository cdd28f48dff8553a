//! De-duplicated credential refresh.
//!
//! Many requests can hit a 401 at the same moment when an access secret
//! expires. Only the first of them starts a network refresh; everyone who
//! arrives while it runs awaits the same shared outcome. Providers that
//! rotate refresh secrets invalidate the old one on use, so a second
//! concurrent refresh would fail and log the user out.
//!
//! The refresh itself runs in a spawned task and always finishes, even if
//! every caller stops waiting.

use std::sync::atomic::Ordering;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};

use super::session::{Identity, SessionManager};
use super::token;
use super::{AuthError, CredentialPair};

pub(super) type SharedOutcome = Shared<BoxFuture<'static, bool>>;

/// The in-flight marker: present only while a refresh is `Refreshing`.
pub(super) struct InFlight {
    cycle: u64,
    outcome: SharedOutcome,
}

/// Observable phase of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
}

impl SessionManager {
    /// Renew the access secret, joining any refresh already in progress.
    ///
    /// Resolves `true` when fresh credentials were stored. On `false` the
    /// session has already been logged out. Never returns an error: every
    /// failure is logged and collapsed into the boolean.
    pub async fn refresh(&self) -> bool {
        let outcome = {
            let mut slot = self.inner.in_flight.lock().await;
            match slot.as_ref().map(|f| (f.cycle, f.outcome.clone())) {
                Some((cycle, outcome)) => {
                    debug!(cycle, "Joining in-flight refresh");
                    outcome
                }
                None => {
                    let cycle = self.inner.next_cycle.fetch_add(1, Ordering::Relaxed);
                    let outcome = self.start_cycle(cycle);
                    *slot = Some(InFlight {
                        cycle,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };
        outcome.await
    }

    pub async fn phase(&self) -> RefreshPhase {
        if self.inner.in_flight.lock().await.is_some() {
            RefreshPhase::Refreshing
        } else {
            RefreshPhase::Idle
        }
    }

    pub async fn is_refreshing(&self) -> bool {
        self.phase().await == RefreshPhase::Refreshing
    }

    /// Spawn the refresh task for `cycle` and wrap its result for sharing.
    /// Called with the in-flight slot locked.
    fn start_cycle(&self, cycle: u64) -> SharedOutcome {
        let generation = *self.lock_generation();
        let worker = self.clone();
        let handle = tokio::spawn(async move {
            let succeeded = worker.run_cycle(cycle, generation).await;
            worker.finish_cycle(cycle).await;
            succeeded
        });

        let session = self.clone();
        async move {
            match handle.await {
                Ok(succeeded) => succeeded,
                Err(e) => {
                    error!(error = %e, cycle, "Refresh task aborted");
                    session.logout_if_current(generation);
                    session.finish_cycle(cycle).await;
                    false
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn run_cycle(&self, cycle: u64, generation: u64) -> bool {
        info!(cycle, "Refreshing credentials");
        match self.rotate_credentials(generation).await {
            Ok(Some(identity)) => {
                info!(cycle, subject = %identity.subject, "Credentials refreshed");
                true
            }
            Ok(None) => {
                info!(cycle, "Session changed during refresh, discarding grant");
                false
            }
            Err(e) => {
                if self.logout_if_current(generation) {
                    warn!(cycle, error = %e, "Refresh failed, logged out");
                } else {
                    warn!(cycle, error = %e, "Refresh failed for a superseded session");
                }
                false
            }
        }
    }

    /// Return to `Idle`, unless a newer cycle already owns the marker.
    async fn finish_cycle(&self, cycle: u64) {
        let mut slot = self.inner.in_flight.lock().await;
        if slot.as_ref().map(|f| f.cycle) == Some(cycle) {
            *slot = None;
        }
    }

    /// Exchange the stored refresh secret for a new pair. `Ok(None)` means a
    /// login or logout happened meanwhile and the grant was dropped.
    async fn rotate_credentials(&self, generation: u64) -> Result<Option<Identity>, AuthError> {
        let current = self.inner.store.load().ok_or(AuthError::NotAuthenticated)?;

        if token::is_expired(&current.refresh, self.now()) {
            return Err(AuthError::RefreshExpired);
        }

        let grant = self.inner.provider.refresh(&current.refresh).await?;
        let claims = token::decode(&grant.access)?;

        let rotated = grant.refresh.is_some();
        let pair = CredentialPair {
            access: grant.access,
            refresh: grant.refresh.unwrap_or(current.refresh),
        };
        self.commit_refresh(generation, &pair, Identity::from(claims), rotated)
    }

    fn commit_refresh(
        &self,
        observed: u64,
        pair: &CredentialPair,
        identity: Identity,
        rotated: bool,
    ) -> Result<Option<Identity>, AuthError> {
        let generation = self.lock_generation();
        if *generation != observed {
            return Ok(None);
        }
        self.inner.store.save(pair)?;
        debug!(rotated, "Stored refreshed credentials");
        self.set_user(Some(identity.clone()));
        Ok(Some(identity))
    }
}
