//! Authentication module for managing the signed-in user's credentials.
//!
//! This module provides:
//! - `CredentialStore`: durable storage for the access/refresh pair
//!   (keychain, JSON file, or memory)
//! - `token`: offline decoding of subject, role and expiry claims
//! - `SessionManager`: the shared session context with bootstrap, login,
//!   logout and the de-duplicated refresh orchestrator
//!
//! A refresh that fails for any reason logs the user out; callers only ever
//! see a boolean outcome.

pub mod clock;
pub mod credentials;
pub mod error;
pub mod refresh;
pub mod session;
pub mod token;

pub use clock::{Clock, SystemClock};
pub use credentials::{CredentialPair, CredentialStore, FileStore, KeyringStore, MemoryStore};
pub use error::AuthError;
pub use refresh::RefreshPhase;
pub use session::{Identity, SessionManager, SessionState, UserInfo};
pub use token::{Claims, Role};
