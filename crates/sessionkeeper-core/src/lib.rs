//! Sessionkeeper core library.
//!
//! Owns the lifecycle of a single user's authentication credentials:
//! - `auth`: credential storage, token inspection, session state and the
//!   de-duplicated refresh orchestrator
//! - `api`: the identity-provider client and the request interceptor that
//!   retries unauthorized calls once after a refresh
//! - `config`: persisted application configuration

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, ApiRequest, ApiResponse, AuthenticatedClient};
pub use auth::{
    AuthError, Clock, CredentialPair, CredentialStore, Identity, Role, SessionManager,
    SessionState, SystemClock,
};
pub use config::{Config, StorageBackend};
