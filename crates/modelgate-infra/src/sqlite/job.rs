//! SQLite job repository.

use modelgate_core::repository::{JobFilter, JobRepository};
use modelgate_types::error::RepositoryError;
use modelgate_types::job::{Job, JobStatus};
use sqlx::Row;
use uuid::Uuid;

use super::store::{
    SqliteStore, format_datetime, from_json, is_unique_violation, parse_datetime, parse_enum,
    parse_uuid, query_err, to_json,
};

const JOB_COLUMNS: &str = "id, kind, pipeline, status, required_models, input, blocked_by, \
                           conflict_reason, queued_at, error, created_at, updated_at";

struct JobRow {
    id: String,
    kind: String,
    pipeline: String,
    status: String,
    required_models: String,
    input: String,
    blocked_by: Option<String>,
    conflict_reason: Option<String>,
    queued_at: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            pipeline: row.try_get("pipeline")?,
            status: row.try_get("status")?,
            required_models: row.try_get("required_models")?,
            input: row.try_get("input")?,
            blocked_by: row.try_get("blocked_by")?,
            conflict_reason: row.try_get("conflict_reason")?,
            queued_at: row.try_get("queued_at")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_job(self) -> Result<Job, RepositoryError> {
        Ok(Job {
            id: parse_uuid(&self.id)?,
            kind: parse_enum(&self.kind)?,
            pipeline: self.pipeline,
            status: parse_enum(&self.status)?,
            required_models: from_json(&self.required_models, "required_models")?,
            input: from_json(&self.input, "job input")?,
            blocked_by: self.blocked_by.as_deref().map(parse_uuid).transpose()?,
            conflict_reason: self.conflict_reason,
            queued_at: self.queued_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

fn rows_to_jobs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Job>, RepositoryError> {
    rows.iter()
        .map(|row| JobRow::from_row(row).map_err(query_err)?.into_job())
        .collect()
}

impl JobRepository for SqliteStore {
    async fn create_job(&self, job: &Job) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO jobs
               (id, kind, pipeline, status, required_models, input, blocked_by,
                conflict_reason, queued_at, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.kind.to_string())
        .bind(&job.pipeline)
        .bind(job.status.as_str())
        .bind(to_json(&job.required_models, "required_models")?)
        .bind(to_json(&job.input, "job input")?)
        .bind(job.blocked_by.map(|id| id.to_string()))
        .bind(&job.conflict_reason)
        .bind(job.queued_at.as_ref().map(format_datetime))
        .bind(&job.error)
        .bind(format_datetime(&job.created_at))
        .bind(format_datetime(&job.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("job {} already exists", job.id))
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(Some(JobRow::from_row(&row).map_err(query_err)?.into_job()?)),
            None => Ok(None),
        }
    }

    async fn update_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE jobs SET
                 status = ?, required_models = ?, blocked_by = ?, conflict_reason = ?,
                 queued_at = ?, error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(job.status.as_str())
        .bind(to_json(&job.required_models, "required_models")?)
        .bind(job.blocked_by.map(|id| id.to_string()))
        .bind(&job.conflict_reason)
        .bind(job.queued_at.as_ref().map(format_datetime))
        .bind(&job.error)
        .bind(format_datetime(&job.updated_at))
        .bind(job.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, RepositoryError> {
        let limit = filter.limit.unwrap_or(-1);
        let rows = match filter.status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        rows_to_jobs(&rows)
    }

    async fn list_queued_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? ORDER BY queued_at ASC, created_at ASC, id ASC"
        ))
        .bind(JobStatus::Queued.as_str())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_to_jobs(&rows)
    }
}
