use thiserror::Error;

/// Failures inside the session core.
///
/// None of these cross into the request path as-is: the refresh orchestrator
/// collapses every variant into a `false` outcome plus a forced logout.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Malformed credential")]
    MalformedCredential,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Refresh secret has expired")]
    RefreshExpired,

    #[error("Refresh rejected: {0}")]
    RefreshRejected(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Login rejected: {0}")]
    LoginRejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AuthError {
    /// Whether the caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::NetworkUnavailable(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthError::InvalidResponse(err.to_string())
        } else {
            AuthError::NetworkUnavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(AuthError::NetworkUnavailable("timeout".into()).is_retryable());
        assert!(!AuthError::RefreshRejected("revoked".into()).is_retryable());
        assert!(!AuthError::LoginRejected("bad password".into()).is_retryable());
        assert!(!AuthError::MalformedCredential.is_retryable());
    }
}
