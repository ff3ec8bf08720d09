//! Session token issuance and validation.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use beacon_common::id::{prefix, prefixed_ulid};

use crate::error::HubError;
use crate::models::user::UserProfile;

/// Issues and validates opaque bearer tokens bound to a user and an expiry.
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn issue(&self, user: &UserProfile) -> Result<String, HubError>;

    /// Fails with `InvalidToken` or `ExpiredToken`.
    async fn validate(&self, token: &str) -> Result<UserProfile, HubError>;
}

/// Claims embedded in a session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub username: String,
    pub display_name: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Longest accepted token lifetime: ten years.
pub const MAX_TOKEN_TTL_SECS: i64 = 10 * 365 * 24 * 3600;

/// HS256 JWTs signed with a shared secret.
pub struct JwtTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl JwtTokenService {
    /// `ttl_secs` is clamped to `±MAX_TOKEN_TTL_SECS`.
    pub fn new(secret: &str, ttl_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl: Duration::seconds(ttl_secs.clamp(-MAX_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS)),
        }
    }
}

#[async_trait]
impl TokenService for JwtTokenService {
    async fn issue(&self, user: &UserProfile) -> Result<String, HubError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: user.user_id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: prefixed_ulid(prefix::TOKEN),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(
            |e| {
                tracing::error!(?e, "failed to sign session token");
                HubError::Internal("token signing failed".to_string())
            },
        )
    }

    async fn validate(&self, token: &str) -> Result<UserProfile, HubError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => HubError::ExpiredToken,
                _ => {
                    tracing::debug!(?e, "session token rejected");
                    HubError::InvalidToken
                }
            })?;

        Ok(UserProfile {
            user_id: data.claims.sub,
            username: data.claims.username,
            display_name: data.claims.display_name,
        })
    }
}
