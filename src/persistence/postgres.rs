use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{ApiKeyRecord, PersistenceLayer, PlatformAdmin};
use crate::audit::AuditRecord;

#[derive(Debug)]
pub struct PostgresProvider {
    pool: PgPool,
}

impl PostgresProvider {
    pub async fn new(connection_string: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_string)
            .await?;

        // Run Migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceLayer for PostgresProvider {
    async fn lookup_api_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT k.id, k.user_id, k.org_id, k.is_active, k.expires_at,
                   p.email, p.display_name, p.role
            FROM api_keys k
            LEFT JOIN profiles p ON p.user_id = k.user_id
            WHERE k.key_hash = $1
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ApiKeyRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            org_id: row.try_get("org_id")?,
            is_active: row.try_get("is_active")?,
            expires_at: row.try_get("expires_at")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            role: row.try_get("role")?,
        }))
    }

    async fn touch_api_key(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_platform_admin(&self, user_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM platform_admins WHERE workos_user_id = $1 AND is_active = TRUE",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn list_platform_admins(&self) -> Result<Vec<PlatformAdmin>> {
        let rows = sqlx::query(
            r#"
            SELECT id, workos_user_id, email, is_active, added_at, added_by
            FROM platform_admins
            WHERE is_active = TRUE
            ORDER BY added_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut admins = Vec::with_capacity(rows.len());
        for row in rows {
            admins.push(PlatformAdmin {
                id: row.try_get("id")?,
                workos_user_id: row.try_get("workos_user_id")?,
                email: row.try_get("email")?,
                is_active: row.try_get("is_active")?,
                added_at: row.try_get("added_at")?,
                added_by: row.try_get("added_by")?,
            });
        }
        Ok(admins)
    }

    async fn add_platform_admin(
        &self,
        email: &str,
        workos_user_id: Option<&str>,
        added_by: &str,
    ) -> Result<PlatformAdmin> {
        let id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            INSERT INTO platform_admins (id, workos_user_id, email, is_active, added_at, added_by)
            VALUES ($1, $2, $3, TRUE, NOW(), $4)
            ON CONFLICT (email) DO UPDATE SET
                is_active = TRUE,
                workos_user_id = COALESCE(EXCLUDED.workos_user_id, platform_admins.workos_user_id),
                added_by = EXCLUDED.added_by
            RETURNING id, workos_user_id, email, is_active, added_at, added_by
            "#,
        )
        .bind(id)
        .bind(workos_user_id)
        .bind(email)
        .bind(added_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(PlatformAdmin {
            id: row.try_get("id")?,
            workos_user_id: row.try_get("workos_user_id")?,
            email: row.try_get("email")?,
            is_active: row.try_get("is_active")?,
            added_at: row.try_get("added_at")?,
            added_by: row.try_get("added_by")?,
        })
    }

    async fn remove_platform_admin(&self, email: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE platform_admins SET is_active = FALSE WHERE email = $1")
            .bind(email)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_audit_batch(&self, records: &[AuditRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO audit_log
                    (id, ts, user_id, org_id, auth_method, agent, outcome,
                     latency_ms, tokens_in, tokens_out, fingerprint)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(record.id)
            .bind(record.ts)
            .bind(&record.user_id)
            .bind(&record.org_id)
            .bind(record.auth_method.map(|m| m.as_str()))
            .bind(&record.agent)
            .bind(record.outcome.as_str())
            .bind(record.latency_ms as i64)
            .bind(i64::from(record.tokens_in))
            .bind(i64::from(record.tokens_out))
            .bind(&record.fingerprint)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn expiry_check_honors_missing_expiry() {
        let record = ApiKeyRecord {
            id: Uuid::new_v4(),
            user_id: "u".into(),
            org_id: "o".into(),
            is_active: true,
            expires_at: None,
            email: None,
            display_name: None,
            role: None,
        };
        assert!(!record.is_expired(Utc::now()));
    }

    #[test]
    fn expiry_check_is_exact() {
        let now = Utc::now();
        let expired = ApiKeyRecord {
            id: Uuid::new_v4(),
            user_id: "u".into(),
            org_id: "o".into(),
            is_active: true,
            expires_at: Some(now - chrono::Duration::seconds(1)),
            email: None,
            display_name: None,
            role: None,
        };
        assert!(expired.is_expired(now));

        let valid = ApiKeyRecord {
            expires_at: Some(now + chrono::Duration::seconds(1)),
            ..expired.clone()
        };
        assert!(!valid.is_expired(now));
    }
}
