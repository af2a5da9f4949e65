//! Database-backed API keys.
//!
//! Keys are stored as SHA-256 hex digests; the inbound credential is hashed
//! and looked up exactly. A matching row must be active and unexpired. The
//! owning profile supplies email, display name, and role. `last_used_at` is
//! refreshed best-effort in the background.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::{AuthError, AuthMethod, CallerIdentity, Role};
use crate::persistence::PersistenceLayer;

/// SHA-256 hex digest of an API key, as stored in `api_keys.key_hash`.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Resolve a credential against the key table.
///
/// `Ok(None)` means "not this method" and lets the chain continue; disabled
/// or expired keys are terminal errors. Database failures are logged and
/// treated as a non-match so a flaky lookup does not lock out JWT callers.
pub async fn resolve(
    persistence: &Arc<dyn PersistenceLayer>,
    credential: &str,
) -> Result<Option<CallerIdentity>, AuthError> {
    let key_hash = hash_key(credential);
    let record = match persistence.lookup_api_key(&key_hash).await {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "api key lookup failed");
            return Ok(None);
        }
    };
    let Some(record) = record else {
        return Ok(None);
    };

    if !record.is_active {
        return Err(AuthError::KeyDisabled);
    }
    if record.is_expired(Utc::now()) {
        return Err(AuthError::KeyExpired);
    }

    {
        let persistence = Arc::clone(persistence);
        let id = record.id;
        tokio::spawn(async move {
            if let Err(err) = persistence.touch_api_key(id).await {
                tracing::debug!(error = %err, "last_used_at update failed");
            }
        });
    }

    Ok(Some(CallerIdentity {
        user_id: record.user_id,
        org_id: record.org_id,
        email: record.email,
        display_name: record.display_name,
        role: record.role.as_deref().map_or(Role::Member, Role::parse),
        is_platform_admin: false,
        auth_method: AuthMethod::DbKey,
        raw_credential: credential.to_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_hex() {
        let a = hash_key("sk-test-123");
        let b = hash_key("sk-test-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_key("sk-test-124"));
    }
}
