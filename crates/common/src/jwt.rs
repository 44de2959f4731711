//! Participant token utilities.
//!
//! Participants authenticate with an HS256 JWT whose `sub` claim is the
//! participant identifier the room coordinator routes by.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HS256 is accepted; `exp` is mandatory
//! - Error messages are generic; the reason is only available to callers
//!   through the error variant
//! - The `sub` field is redacted in Debug output

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum accepted token size in bytes (8KB).
///
/// Checked before any base64 decoding or signature work.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Errors produced while validating or issuing a participant token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("The access token is invalid or expired")]
    TooLarge,

    #[error("The access token is invalid or expired")]
    Expired,

    #[error("The access token is invalid or expired")]
    MissingSubject,

    #[error("The access token is invalid or expired")]
    Invalid,

    #[error("Failed to sign token: {0}")]
    Signing(String),
}

/// Claims carried by a participant token.
#[derive(Clone, Serialize, Deserialize)]
pub struct ParticipantClaims {
    /// Subject: the participant identifier. Redacted in Debug output.
    pub sub: String,
    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,
    /// Issued-at timestamp (Unix epoch seconds).
    #[serde(default)]
    pub iat: i64,
}

impl fmt::Debug for ParticipantClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .finish()
    }
}

/// Validate a participant token and return its claims.
///
/// # Errors
///
/// Returns `TokenError::TooLarge` for oversized input, `Expired` for an
/// expired token, `MissingSubject` for an empty `sub`, and `Invalid` for any
/// other decode or signature failure.
pub fn validate_participant_token(
    token: &str,
    secret: &SecretString,
) -> Result<ParticipantClaims, TokenError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        return Err(TokenError::TooLarge);
    }

    let key = DecodingKey::from_secret(secret.expose_secret().as_bytes());
    let validation = Validation::new(Algorithm::HS256);

    let data = decode::<ParticipantClaims>(token, &key, &validation).map_err(|e| {
        match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid,
        }
    })?;

    if data.claims.sub.trim().is_empty() {
        return Err(TokenError::MissingSubject);
    }

    Ok(data.claims)
}

/// Issue a participant token valid for `ttl`.
///
/// The coordinator itself never issues tokens; this exists for the account
/// service side of a deployment and for test fixtures.
///
/// # Errors
///
/// Returns `TokenError::Signing` if encoding fails.
pub fn issue_participant_token(
    participant_id: &str,
    ttl: Duration,
    secret: &SecretString,
) -> Result<String, TokenError> {
    let now = chrono::Utc::now().timestamp();
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    let claims = ParticipantClaims {
        sub: participant_id.to_string(),
        exp: now.saturating_add(ttl_secs),
        iat: now,
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.expose_secret().as_bytes()),
    )
    .map_err(|e| TokenError::Signing(e.to_string()))
}
