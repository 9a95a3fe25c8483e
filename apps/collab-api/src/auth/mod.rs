//! Connection authentication: token extraction and identity verification.

pub mod jwt;
pub mod tokens;

use async_trait::async_trait;

use crate::error::ApiError;
use crate::gateway::events::User;

pub use self::jwt::JwtVerifier;

/// Turns a bearer token into the user it identifies.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<User, ApiError>;
}
