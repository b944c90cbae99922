// Shared models for the API Gateway

use serde::{Deserialize, Serialize};

/// Claims carried in a gateway access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier
    pub user_id: String,

    /// Username
    pub username: String,

    /// Role name used by role guards
    pub role: String,

    /// Expiration time (Unix seconds)
    pub exp: u64,

    /// Issued at (Unix seconds)
    pub iat: u64,

    /// Not before (Unix seconds)
    pub nbf: u64,

    /// Issuer
    pub iss: String,
}

impl Claims {
    /// Check whether the claims are expired at `now` (Unix seconds)
    pub fn is_expired(&self, now: u64) -> bool {
        self.exp < now
    }

    /// Check whether the claims are not yet valid at `now` (Unix seconds)
    pub fn is_not_valid_yet(&self, now: u64) -> bool {
        self.nbf > now
    }
}

/// Authenticated identity published into the request context
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub role: String,

    /// Full claim set the identity was derived from
    pub claims: Claims,
}

impl Identity {
    pub fn from_claims(claims: Claims) -> Self {
        Self {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
            role: claims.role.clone(),
            claims,
        }
    }
}
