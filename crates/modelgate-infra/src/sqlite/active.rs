//! SQLite active-state store.
//!
//! The active set is one JSON row guarded by a version column. A write only
//! lands when the stored version still equals the caller's expected version,
//! which keeps coordinators in separate processes from overwriting each
//! other.

use chrono::Utc;
use modelgate_core::repository::ActiveStateStore;
use modelgate_types::admission::{ActiveJob, ActiveState};
use modelgate_types::error::RepositoryError;
use sqlx::Row;

use super::store::{SqliteStore, format_datetime, from_json, query_err, to_json};

impl ActiveStateStore for SqliteStore {
    async fn load_active(&self) -> Result<ActiveState, RepositoryError> {
        let row = sqlx::query("SELECT version, jobs FROM active_state WHERE id = 1")
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(ActiveState::default());
        };
        let version: i64 = row.try_get("version").map_err(query_err)?;
        let jobs: String = row.try_get("jobs").map_err(query_err)?;
        Ok(ActiveState {
            jobs: from_json::<Vec<ActiveJob>>(&jobs, "active jobs")?,
            version: version as u64,
        })
    }

    async fn compare_and_swap_active(
        &self,
        expected_version: u64,
        next: &ActiveState,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE active_state SET jobs = ?, version = version + 1, updated_at = ? WHERE id = 1 AND version = ?",
        )
        .bind(to_json(&next.jobs, "active jobs")?)
        .bind(format_datetime(&Utc::now()))
        .bind(expected_version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::store::test_support::test_store;
    use modelgate_types::job::JobKind;
    use uuid::Uuid;

    fn entry(model: &str) -> ActiveJob {
        ActiveJob {
            job_id: Uuid::now_v7(),
            kind: JobKind::Simple,
            models: vec![model.to_string()],
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn starts_empty_at_version_zero() {
        let store = test_store().await;
        let state = store.load_active().await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.version, 0);
    }

    #[tokio::test]
    async fn swap_bumps_version_and_rejects_stale_writers() {
        let store = test_store().await;
        let mut next = store.load_active().await.unwrap();
        let first = entry("gen-x");
        next.insert(first.clone());
        assert!(store.compare_and_swap_active(0, &next).await.unwrap());

        let state = store.load_active().await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.jobs, vec![first]);

        // A writer that read version 0 loses.
        let mut stale = ActiveState::default();
        stale.insert(entry("gen-y"));
        assert!(!store.compare_and_swap_active(0, &stale).await.unwrap());
        assert_eq!(store.load_active().await.unwrap().version, 1);
    }
}
