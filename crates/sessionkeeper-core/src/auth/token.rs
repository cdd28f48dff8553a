//! Offline inspection of JWT-shaped secrets.
//!
//! Secrets are never verified here; the identity provider is the only party
//! that can vouch for a signature. The client only needs the subject, role
//! and expiry to decide what to show and when to refresh.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Role carried by an access secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Role {
    Admin,
    #[default]
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claims decoded from a secret. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub subject: String,
    pub role: Role,
    pub expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    #[serde(alias = "user_id")]
    sub: serde_json::Value,
    #[serde(default)]
    role: Option<Role>,
    exp: i64,
}

/// Decode the payload segment of a `header.payload.signature` secret.
pub fn decode(secret: &str) -> Result<Claims, AuthError> {
    let mut segments = secret.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(AuthError::MalformedCredential),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| AuthError::MalformedCredential)?;
    let raw: RawClaims =
        serde_json::from_slice(&bytes).map_err(|_| AuthError::MalformedCredential)?;

    let subject = match raw.sub {
        serde_json::Value::String(s) if !s.is_empty() => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => return Err(AuthError::MalformedCredential),
    };

    Ok(Claims {
        subject,
        role: raw.role.unwrap_or_default(),
        expires_at: raw.exp,
    })
}

/// Fail-closed expiry check: anything that does not decode counts as expired.
pub fn is_expired(secret: &str, now: i64) -> bool {
    expires_within(secret, now, 0)
}

/// True when the secret is expired, undecodable, or will expire within
/// `leeway_secs` of `now`.
pub fn expires_within(secret: &str, now: i64, leeway_secs: i64) -> bool {
    match decode(secret) {
        Ok(claims) => claims.expires_at < now.saturating_add(leeway_secs),
        Err(_) => true,
    }
}
