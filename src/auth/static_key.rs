//! Static-key authentication.
//!
//! A single process-configured secret, intended for development and
//! service-to-service use. The method is active only when the secret is
//! configured, and a match always yields an org-admin, platform-admin
//! identity built from configuration.

use ring::constant_time::verify_slices_are_equal;
use sha2::{Digest, Sha256};

use super::{AuthMethod, CallerIdentity, Role};

#[derive(Clone)]
pub struct StaticKeyAuth {
    key_digest: [u8; 32],
    user_id: String,
    org_id: String,
    email: Option<String>,
    display_name: Option<String>,
}

impl std::fmt::Debug for StaticKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyAuth")
            .field("user_id", &self.user_id)
            .field("org_id", &self.org_id)
            .finish()
    }
}

impl StaticKeyAuth {
    pub fn new(
        key: &str,
        user_id: String,
        org_id: String,
        email: Option<String>,
        display_name: Option<String>,
    ) -> Self {
        Self {
            key_digest: Sha256::digest(key.as_bytes()).into(),
            user_id,
            org_id,
            email,
            display_name,
        }
    }

    /// Compare the full credential in constant time. Both sides are hashed
    /// first so the comparison length never depends on the input.
    pub fn verify(&self, credential: &str) -> Option<CallerIdentity> {
        let candidate: [u8; 32] = Sha256::digest(credential.as_bytes()).into();
        verify_slices_are_equal(&candidate, &self.key_digest).ok()?;
        Some(CallerIdentity {
            user_id: self.user_id.clone(),
            org_id: self.org_id.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            role: Role::OrgAdmin,
            is_platform_admin: true,
            auth_method: AuthMethod::StaticKey,
            raw_credential: credential.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> StaticKeyAuth {
        StaticKeyAuth::new(
            "dev-key-1",
            "static-user".into(),
            "static-org".into(),
            Some("dev@example.com".into()),
            Some("Dev".into()),
        )
    }

    #[test]
    fn matching_key_yields_admin_identity() {
        let identity = auth().verify("dev-key-1").expect("key should match");
        assert_eq!(identity.user_id, "static-user");
        assert_eq!(identity.role, Role::OrgAdmin);
        assert!(identity.is_platform_admin);
        assert_eq!(identity.auth_method, AuthMethod::StaticKey);
    }

    #[test]
    fn wrong_key_is_rejected() {
        assert!(auth().verify("wrong").is_none());
        assert!(auth().verify("").is_none());
        assert!(auth().verify("dev-key-1 ").is_none());
    }
}
