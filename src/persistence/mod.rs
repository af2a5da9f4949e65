//! Persisted state: API keys, platform admins, and the audit log.
//!
//! The gateway runs fine with no database at all (static key + JWT only);
//! everything here sits behind [`PersistenceLayer`] so handlers take an
//! `Option<Arc<dyn PersistenceLayer>>` and degrade gracefully.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::AuditRecord;

/// An `api_keys` row joined with its owner's profile.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: String,
    pub org_id: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub role: Option<String>,
}

impl ApiKeyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// A `platform_admins` row.
#[derive(Debug, Clone, Serialize)]
pub struct PlatformAdmin {
    pub id: Uuid,
    pub workos_user_id: Option<String>,
    pub email: String,
    pub is_active: bool,
    pub added_at: DateTime<Utc>,
    pub added_by: Option<String>,
}

#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    /// Look up an API key by its SHA-256 hex digest.
    async fn lookup_api_key(&self, key_hash: &str) -> anyhow::Result<Option<ApiKeyRecord>>;

    /// Best-effort `last_used_at` refresh.
    async fn touch_api_key(&self, id: Uuid) -> anyhow::Result<()>;

    /// Is there an active platform-admin row for this user id?
    async fn is_platform_admin(&self, user_id: &str) -> anyhow::Result<bool>;

    async fn list_platform_admins(&self) -> anyhow::Result<Vec<PlatformAdmin>>;

    async fn add_platform_admin(
        &self,
        email: &str,
        workos_user_id: Option<&str>,
        added_by: &str,
    ) -> anyhow::Result<PlatformAdmin>;

    /// Deactivate an admin by email; returns false when no row matched.
    async fn remove_platform_admin(&self, email: &str) -> anyhow::Result<bool>;

    /// Append a batch of audit records.
    async fn insert_audit_batch(&self, records: &[AuditRecord]) -> anyhow::Result<()>;
}
