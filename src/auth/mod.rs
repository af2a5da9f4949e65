//! Caller authentication.
//!
//! Inbound bearer credentials are resolved against an ordered chain of
//! methods, short-circuiting on the first success:
//!
//! 1. process-configured static key (constant-time compare),
//! 2. database-backed API key (SHA-256 hex lookup),
//! 3. signed JWT against a cached JWKS.
//!
//! Whichever method succeeds, a platform-admin lookup may still force
//! [`CallerIdentity::is_platform_admin`] on. Credentials are never logged in
//! full and never appear in error messages.

pub mod db_key;
pub mod jwt;
pub mod middleware;
pub mod static_key;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::persistence::PersistenceLayer;

/// Which method authenticated the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    StaticKey,
    DbKey,
    Jwt,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaticKey => "static_key",
            Self::DbKey => "db_key",
            Self::Jwt => "jwt",
        }
    }
}

/// Caller role within their org.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Member,
    OrgAdmin,
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "org_admin" | "admin" | "owner" => Self::OrgAdmin,
            "viewer" | "read_only" => Self::Viewer,
            _ => Self::Member,
        }
    }
}

/// Immutable, request-scoped identity of an authenticated caller.
#[derive(Clone)]
pub struct CallerIdentity {
    pub user_id: String,
    pub org_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    pub is_platform_admin: bool,
    pub auth_method: AuthMethod,
    /// The credential that authenticated this request. Opaque; the Debug
    /// impl redacts it and it must never be logged in full.
    pub raw_credential: String,
}

impl std::fmt::Debug for CallerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerIdentity")
            .field("user_id", &self.user_id)
            .field("org_id", &self.org_id)
            .field("role", &self.role)
            .field("is_platform_admin", &self.is_platform_admin)
            .field("auth_method", &self.auth_method)
            .field("raw_credential", &redact(&self.raw_credential))
            .finish()
    }
}

fn redact(credential: &str) -> String {
    let prefix: String = credential.chars().take(4).collect();
    format!("{prefix}…")
}

/// Why authentication failed. None of these carry the credential itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("Authorization header must be 'Bearer <credential>'")]
    MalformedHeader,
    #[error("credential did not match any configured auth method")]
    NoMethodMatched,
    #[error("credential is expired")]
    Expired,
    #[error("credential signature is invalid")]
    SignatureInvalid,
    #[error("API key is disabled")]
    KeyDisabled,
    #[error("API key is expired")]
    KeyExpired,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader => "missing_header",
            Self::MalformedHeader => "malformed_header",
            Self::NoMethodMatched => "no_method_matched",
            Self::Expired => "expired",
            Self::SignatureInvalid => "signature_invalid",
            Self::KeyDisabled => "key_disabled",
            Self::KeyExpired => "key_expired",
        }
    }
}

/// The ordered resolution chain.
pub struct Authenticator {
    static_key: Option<static_key::StaticKeyAuth>,
    persistence: Option<Arc<dyn PersistenceLayer>>,
    jwt: Option<Arc<jwt::JwtValidator>>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("static_key", &self.static_key.is_some())
            .field("db_key", &self.persistence.is_some())
            .field("jwt", &self.jwt.is_some())
            .finish()
    }
}

impl Authenticator {
    pub fn new(
        static_key: Option<static_key::StaticKeyAuth>,
        persistence: Option<Arc<dyn PersistenceLayer>>,
        jwt: Option<Arc<jwt::JwtValidator>>,
    ) -> Self {
        Self {
            static_key,
            persistence,
            jwt,
        }
    }

    pub fn jwt_validator(&self) -> Option<Arc<jwt::JwtValidator>> {
        self.jwt.clone()
    }

    /// Resolve a bearer credential to a [`CallerIdentity`].
    pub async fn resolve(&self, credential: &str) -> Result<CallerIdentity, AuthError> {
        if let Some(static_key) = &self.static_key {
            if let Some(identity) = static_key.verify(credential) {
                return Ok(self.with_admin_override(identity).await);
            }
        }

        if let Some(persistence) = &self.persistence {
            match db_key::resolve(persistence, credential).await {
                Ok(Some(identity)) => return Ok(self.with_admin_override(identity).await),
                Ok(None) => {}
                Err(err) => return Err(err),
            }
        }

        if let Some(jwt) = &self.jwt {
            // Only credentials shaped like a compact JWS are tried against
            // the JWT validator; anything else falls through to the terminal
            // no-match error.
            if credential.split('.').count() == 3 {
                let identity = jwt.validate(credential).await?;
                return Ok(self.with_admin_override(identity).await);
            }
        }

        Err(AuthError::NoMethodMatched)
    }

    /// Force `is_platform_admin` on when the admin table says so. The flag is
    /// only ever widened here, never revoked.
    async fn with_admin_override(&self, mut identity: CallerIdentity) -> CallerIdentity {
        if identity.is_platform_admin {
            return identity;
        }
        if let Some(persistence) = &self.persistence {
            match persistence.is_platform_admin(&identity.user_id).await {
                Ok(true) => identity.is_platform_admin = true,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "platform admin lookup failed");
                }
            }
        }
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_is_forgiving() {
        assert_eq!(Role::parse("org_admin"), Role::OrgAdmin);
        assert_eq!(Role::parse("ADMIN"), Role::OrgAdmin);
        assert_eq!(Role::parse("viewer"), Role::Viewer);
        assert_eq!(Role::parse("member"), Role::Member);
        assert_eq!(Role::parse("something-else"), Role::Member);
    }

    #[test]
    fn debug_redacts_credential() {
        let identity = CallerIdentity {
            user_id: "u1".into(),
            org_id: "o1".into(),
            email: None,
            display_name: None,
            role: Role::Member,
            is_platform_admin: false,
            auth_method: AuthMethod::StaticKey,
            raw_credential: "super-secret-key-value".into(),
        };
        let rendered = format!("{identity:?}");
        assert!(!rendered.contains("super-secret-key-value"));
        assert!(rendered.contains("supe…"));
    }

    #[tokio::test]
    async fn empty_chain_rejects() {
        let auth = Authenticator::new(None, None, None);
        assert_eq!(
            auth.resolve("anything").await.unwrap_err(),
            AuthError::NoMethodMatched
        );
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AuthError::Expired.code(), "expired");
        assert_eq!(AuthError::KeyDisabled.code(), "key_disabled");
        assert_eq!(AuthError::MissingHeader.code(), "missing_header");
    }
}
