use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::MAX_TOKEN_LENGTH;
use crate::error::{JukeboxError, Result};

/// Lifetime of tokens minted by `issue_join_token`
const JOIN_TOKEN_TTL_SECS: u64 = 24 * 3600;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Room-scoped join claim issued by the web front end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinClaims {
    /// Identity of the joining user
    pub user_id: String,
    /// Host of the room being joined
    pub creator_id: String,
    /// Expiration time (as UTC timestamp)
    pub exp: u64,
    /// Issued at; the web front end writes milliseconds here, so it is never validated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Room the claim is scoped to, when the issuer provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<String>,
}

impl JoinClaims {
    /// Creates claims valid for 24 hours
    pub fn new(user_id: impl Into<String>, creator_id: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            user_id: user_id.into(),
            creator_id: creator_id.into(),
            exp: now + JOIN_TOKEN_TTL_SECS,
            iat: Some(now),
            space_id: None,
        }
    }

    /// Restricts the claim to a single room
    pub fn for_space(mut self, space_id: impl Into<String>) -> Self {
        self.space_id = Some(space_id.into());
        self
    }

    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        now_secs() > self.exp
    }
}

/// Verifies join tokens (and mints them for tooling and tests)
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenManager {
    /// Creates a new token manager with a shared HS256 secret
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::default();
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Signs a join token for the given claims
    pub fn issue_join_token(&self, claims: &JoinClaims) -> Result<String> {
        encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| JukeboxError::Unauthorized(format!("Failed to generate token: {}", e)))
    }

    /// Verifies signature and expiry, then checks the claim against the room being joined
    pub fn verify_join_token(&self, token: &str, space_id: &str) -> Result<JoinClaims> {
        // SECURITY: Reject oversized or binary tokens before decoding
        if token.is_empty() || token.len() > MAX_TOKEN_LENGTH {
            return Err(JukeboxError::Unauthorized("Token verification failed".to_string()));
        }
        if token.chars().any(|c| c.is_control()) {
            return Err(JukeboxError::Unauthorized("Token verification failed".to_string()));
        }

        let claims = decode::<JoinClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                log::debug!("Join token rejected: {}", e);
                JukeboxError::Unauthorized("Token verification failed".to_string())
            })?
            .claims;

        if claims.is_expired() {
            return Err(JukeboxError::Unauthorized("Token verification failed".to_string()));
        }
        if claims.user_id.is_empty() || claims.creator_id.is_empty() {
            return Err(JukeboxError::Unauthorized("Token verification failed".to_string()));
        }
        if let Some(scoped) = &claims.space_id {
            if scoped != space_id {
                return Err(JukeboxError::Unauthorized(
                    "Token is not valid for this room".to_string(),
                ));
            }
        }

        Ok(claims)
    }
}
