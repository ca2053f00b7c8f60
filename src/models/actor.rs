//! Authenticated actor identity carried in bearer tokens

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Staff and member roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Librarian,
    Member,
}

/// JWT claims for an authenticated actor.
///
/// Tokens are issued by the identity provider; this server only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorClaims {
    /// Actor id, recorded as `issued_by` on loans
    pub sub: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

impl ActorClaims {
    /// Create a signed token
    pub fn create_token(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{encode, EncodingKey, Header};
        encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }

    /// Parse and verify a token
    pub fn from_token(token: &str, secret: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{decode, DecodingKey, Validation};
        let token_data = decode::<Self>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Librarian)
    }

    /// Catalog and member writes, issue and return
    pub fn require_staff(&self) -> Result<(), AppError> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(AppError::Authorization(
                "Librarian or administrator privileges required".to_string(),
            ))
        }
    }

    /// Deletions, loan purge and inventory audit
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Authorization("Administrator privileges required".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claims(role: Role) -> ActorClaims {
        let now = Utc::now().timestamp();
        ActorClaims {
            sub: Uuid::new_v4(),
            name: Some("Test".into()),
            role,
            exp: now + 3600,
            iat: now,
        }
    }

    #[test]
    fn test_token_round_trip() {
        let original = claims(Role::Librarian);
        let token = original.create_token("secret").unwrap();
        let parsed = ActorClaims::from_token(&token, "secret").unwrap();
        assert_eq!(parsed.sub, original.sub);
        assert_eq!(parsed.role, Role::Librarian);
        assert!(ActorClaims::from_token(&token, "other").is_err());
    }

    #[test]
    fn test_role_checks() {
        assert!(claims(Role::Admin).require_admin().is_ok());
        assert!(claims(Role::Librarian).require_admin().is_err());
        assert!(claims(Role::Librarian).require_staff().is_ok());
        assert!(claims(Role::Member).require_staff().is_err());
    }
}
