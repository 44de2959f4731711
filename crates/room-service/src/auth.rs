//! Participant identity for the WebSocket upgrade.
//!
//! The upgrade handler resolves the participant before the socket is
//! accepted; a request without a resolvable identity gets a 401 and never
//! reaches the registry.
//!
//! The token is looked up in order:
//! 1. `Authorization: Bearer <token>` header
//! 2. `token` cookie
//! 3. `?token=` query parameter (browsers cannot set headers on WebSocket)

use crate::errors::RoomError;

use axum::http::{header, HeaderMap};
use common::jwt::{validate_participant_token, TokenError};
use common::secret::SecretString;
use common::types::ParticipantId;
use tracing::debug;

/// Resolves the participant behind an upgrade request.
pub trait IdentityResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns `RoomError::Unauthorized` when no valid identity is present.
    fn resolve(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<ParticipantId, RoomError>;
}

/// HS256 participant-token resolver.
pub struct JwtIdentityResolver {
    secret: SecretString,
}

impl JwtIdentityResolver {
    #[must_use]
    pub fn new(secret: SecretString) -> Self {
        Self { secret }
    }
}

impl IdentityResolver for JwtIdentityResolver {
    fn resolve(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<ParticipantId, RoomError> {
        let token = bearer_token(headers)
            .or_else(|| cookie_token(headers))
            .or(query_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                debug!(target: "rc.auth", "No participant token on request");
                RoomError::Unauthorized("Missing participant token".to_string())
            })?;

        let claims = validate_participant_token(token, &self.secret).map_err(|e| {
            debug!(target: "rc.auth", error = %e, "Participant token rejected");
            match e {
                TokenError::Expired => RoomError::Unauthorized("Token expired".to_string()),
                _ => RoomError::Unauthorized("Invalid participant token".to_string()),
            }
        })?;

        Ok(ParticipantId::new(claims.sub))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .find_map(|pair| pair.trim().strip_prefix("token="))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use common::jwt::issue_participant_token;
    use std::time::Duration;

    fn secret() -> SecretString {
        SecretString::from("test-jwt-secret-0123456789".to_string())
    }

    fn token(sub: &str) -> String {
        issue_participant_token(sub, Duration::from_secs(60), &secret()).unwrap()
    }

    #[test]
    fn test_bearer_header_wins() {
        let resolver = JwtIdentityResolver::new(secret());
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token("alice"))).unwrap(),
        );
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("token={}", token("bob"))).unwrap(),
        );

        let id = resolver.resolve(&headers, Some(&token("carol"))).unwrap();
        assert_eq!(id, ParticipantId::new("alice"));
    }

    #[test]
    fn test_cookie_then_query() {
        let resolver = JwtIdentityResolver::new(secret());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; token={}", token("bob"))).unwrap(),
        );
        assert_eq!(
            resolver.resolve(&headers, None).unwrap(),
            ParticipantId::new("bob")
        );

        assert_eq!(
            resolver
                .resolve(&HeaderMap::new(), Some(&token("carol")))
                .unwrap(),
            ParticipantId::new("carol")
        );
    }

    #[test]
    fn test_missing_token_is_unauthorized() {
        let resolver = JwtIdentityResolver::new(secret());
        let err = resolver.resolve(&HeaderMap::new(), None).unwrap_err();
        assert!(matches!(err, RoomError::Unauthorized(_)));

        let err = resolver.resolve(&HeaderMap::new(), Some("")).unwrap_err();
        assert!(matches!(err, RoomError::Unauthorized(_)));
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let resolver = JwtIdentityResolver::new(secret());
        let forged = issue_participant_token(
            "mallory",
            Duration::from_secs(60),
            &SecretString::from("some-other-secret-abcdef".to_string()),
        )
        .unwrap();

        let err = resolver.resolve(&HeaderMap::new(), Some(&forged)).unwrap_err();
        assert_eq!(err.client_message(), "Invalid participant token");
    }
}
