//! Caller authentication.
//!
//! Beacon does not own sessions. The upstream session layer authenticates
//! the caller and forwards the user id; an [`Authenticator`] turns request
//! headers into that id and decides which chat rooms the user may join.

use async_trait::async_trait;
use axum::http::header::{HeaderMap, HeaderName, InvalidHeaderName};
use thiserror::Error;

/// Longest accepted user id, in bytes.
const MAX_USER_ID_LENGTH: usize = 128;

/// Authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No credentials on the request.
    #[error("Missing credentials")]
    Missing,

    /// Credentials present but unusable.
    #[error("Invalid credentials: {0}")]
    Invalid(&'static str),
}

/// Resolves the user behind a request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a request and return the user id.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError>;

    /// Check whether a user may receive a chat room's messages.
    async fn can_join_room(&self, _user_id: &str, _room: &str) -> bool {
        true
    }
}

/// Trusts a user id header set by the reverse proxy.
#[derive(Debug, Clone)]
pub struct TrustedHeaderAuthenticator {
    header: HeaderName,
}

impl TrustedHeaderAuthenticator {
    /// Create an authenticator reading `header`.
    ///
    /// # Errors
    ///
    /// Returns an error if `header` is not a valid header name.
    pub fn new(header: &str) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            header: HeaderName::from_bytes(header.to_ascii_lowercase().as_bytes())?,
        })
    }
}

#[async_trait]
impl Authenticator for TrustedHeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let value = headers.get(&self.header).ok_or(AuthError::Missing)?;
        let user_id = value
            .to_str()
            .map_err(|_| AuthError::Invalid("user id is not ASCII"))?
            .trim();

        validate_user_id(user_id)?;
        Ok(user_id.to_string())
    }
}

/// Check a user id can name a notification channel.
fn validate_user_id(user_id: &str) -> Result<(), AuthError> {
    if user_id.is_empty() {
        return Err(AuthError::Missing);
    }
    if user_id.len() > MAX_USER_ID_LENGTH {
        return Err(AuthError::Invalid("user id too long"));
    }
    if !user_id.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(AuthError::Invalid("user id contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(name: &'static str, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_static(value));
        headers
    }

    #[tokio::test]
    async fn test_reads_configured_header() {
        let auth = TrustedHeaderAuthenticator::new("X-Authenticated-User").unwrap();

        assert_eq!(
            auth.authenticate(&headers("x-authenticated-user", " u1 ")).await,
            Ok("u1".to_string())
        );
        assert_eq!(
            auth.authenticate(&headers("x-other", "u1")).await,
            Err(AuthError::Missing)
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_user_ids() {
        let auth = TrustedHeaderAuthenticator::new("x-user").unwrap();

        assert_eq!(auth.authenticate(&headers("x-user", "")).await, Err(AuthError::Missing));
        assert!(matches!(
            auth.authenticate(&headers("x-user", "a b")).await,
            Err(AuthError::Invalid(_))
        ));

        let mut long = HeaderMap::new();
        long.insert("x-user", HeaderValue::from_str(&"u".repeat(200)).unwrap());
        assert!(auth.authenticate(&long).await.is_err());
    }

    #[tokio::test]
    async fn test_every_room_allowed_by_default() {
        let auth = TrustedHeaderAuthenticator::new("x-user").unwrap();
        assert!(auth.can_join_room("u1", "m1").await);
    }

    #[test]
    fn test_invalid_header_name() {
        assert!(TrustedHeaderAuthenticator::new("bad header").is_err());
    }
}
