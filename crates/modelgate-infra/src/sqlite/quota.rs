//! SQLite quota provider.
//!
//! A `provider:model` pair without an enabled row is unlimited.

use chrono::Utc;
use modelgate_core::provider::QuotaProvider;
use modelgate_types::config::QuotaConfig;
use modelgate_types::error::RepositoryError;
use serde::Serialize;
use sqlx::Row;

use super::pool::DatabasePool;
use super::store::{format_datetime, query_err};

/// One row of the quota table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub provider: String,
    pub model: String,
    pub used: u64,
    pub limit: u64,
    pub enabled: bool,
}

pub struct SqliteQuotaProvider {
    pool: DatabasePool,
}

impl SqliteQuotaProvider {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Create or update the limit for a pair. Usage is kept.
    pub async fn set_quota(
        &self,
        provider: &str,
        model: &str,
        limit: u64,
        enabled: bool,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO model_quotas (provider, model, quota_used, quota_limit, enabled, updated_at)
               VALUES (?, ?, 0, ?, ?, ?)
               ON CONFLICT(provider, model) DO UPDATE SET
                 quota_limit = excluded.quota_limit,
                 enabled = excluded.enabled,
                 updated_at = excluded.updated_at"#,
        )
        .bind(provider)
        .bind(model)
        .bind(limit as i64)
        .bind(enabled)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        tracing::info!(provider, model, limit, enabled, "quota set");
        Ok(())
    }

    /// Zero the usage counter of a pair. `NotFound` if no limit exists.
    pub async fn reset_quota(&self, provider: &str, model: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE model_quotas SET quota_used = 0, updated_at = ? WHERE provider = ? AND model = ?",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(provider)
        .bind(model)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        tracing::info!(provider, model, "quota reset");
        Ok(())
    }

    pub async fn list_quotas(&self) -> Result<Vec<QuotaUsage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT provider, model, quota_used, quota_limit, enabled FROM model_quotas ORDER BY provider, model",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter()
            .map(|row| {
                let used: i64 = row.try_get("quota_used")?;
                let limit: i64 = row.try_get("quota_limit")?;
                Ok(QuotaUsage {
                    provider: row.try_get("provider")?,
                    model: row.try_get("model")?,
                    used: used.max(0) as u64,
                    limit: limit.max(0) as u64,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(query_err)
    }

    /// Apply the limits declared in `config.toml`.
    pub async fn sync_from_config(&self, quotas: &[QuotaConfig]) -> Result<(), RepositoryError> {
        for quota in quotas {
            self.set_quota(&quota.provider, &quota.model, quota.limit, quota.enabled)
                .await?;
        }
        Ok(())
    }
}

impl QuotaProvider for SqliteQuotaProvider {
    async fn has_capacity(&self, provider: &str, model: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            "SELECT quota_used, quota_limit FROM model_quotas WHERE provider = ? AND model = ? AND enabled = 1",
        )
        .bind(provider)
        .bind(model)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        match row {
            Some(row) => {
                let used: i64 = row.try_get("quota_used").map_err(query_err)?;
                let limit: i64 = row.try_get("quota_limit").map_err(query_err)?;
                Ok(used < limit)
            }
            None => Ok(true),
        }
    }

    async fn record_usage(&self, provider: &str, model: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE model_quotas SET quota_used = quota_used + 1, updated_at = ? WHERE provider = ? AND model = ?",
        )
        .bind(format_datetime(&Utc::now()))
        .bind(provider)
        .bind(model)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }
}
