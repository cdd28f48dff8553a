//! Backend access for the session core.
//!
//! This module provides the `IdentityProvider` used for login, refresh and
//! logout, and the `AuthenticatedClient` that wraps every other backend call
//! with bearer authentication and a single refresh-and-retry on 401.

pub mod client;
pub mod error;
pub mod provider;

pub use client::{ApiRequest, ApiResponse, AuthenticatedClient, HttpTransport, Transport};
pub use error::ApiError;
pub use provider::{HttpIdentityProvider, IdentityProvider, LoginGrant, RefreshGrant};
