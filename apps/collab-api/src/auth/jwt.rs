//! HS256 bearer-token verification.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::IdentityVerifier;
use crate::error::ApiError;
use crate::gateway::events::User;

/// Claims carried by collaboration access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Claims {
    /// The connected user these claims describe.
    pub fn into_user(self) -> User {
        let now = Utc::now();
        let name = if self.name.is_empty() {
            self.email.clone()
        } else {
            self.name
        };
        User {
            id: self.sub,
            email: self.email,
            name,
            avatar: self.avatar,
            role: self.role,
            permissions: self.permissions,
            session_id: self.session_id.filter(|s| !s.is_empty()),
            connected_at: now,
            last_seen: now,
            is_online: true,
        }
    }
}

/// Verifies tokens signed with a shared HMAC secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<User, ApiError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| {
                tracing::debug!(?e, "token verification failed");
                ApiError::unauthorized("Invalid or expired token")
            },
        )?;

        if data.claims.sub.is_empty() {
            return Err(ApiError::unauthorized("Token has no subject"));
        }
        Ok(data.claims.into_user())
    }
}
