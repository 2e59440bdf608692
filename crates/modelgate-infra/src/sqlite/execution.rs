//! SQLite execution and checkpoint repository.
//!
//! Checkpoints are upserted per `(job_id, step_index)`, but a row that is
//! already `completed` is never overwritten.

use std::collections::BTreeMap;

use modelgate_core::repository::ExecutionRepository;
use modelgate_types::error::RepositoryError;
use modelgate_types::execution::{StepCheckpoint, WorkflowExecution};
use modelgate_types::failure::StepFailure;
use sqlx::Row;
use uuid::Uuid;

use super::store::{
    SqliteStore, format_datetime, from_json, is_foreign_key_violation, is_unique_violation,
    parse_datetime, parse_enum, parse_uuid, query_err, to_json,
};

struct ExecutionRow {
    job_id: String,
    total_steps: i64,
    current_step: i64,
    status: String,
    input: String,
    retry_count: i64,
    last_failure: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            total_steps: row.try_get("total_steps")?,
            current_step: row.try_get("current_step")?,
            status: row.try_get("status")?,
            input: row.try_get("input")?,
            retry_count: row.try_get("retry_count")?,
            last_failure: row.try_get("last_failure")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_execution(
        self,
        checkpoints: BTreeMap<u32, StepCheckpoint>,
    ) -> Result<WorkflowExecution, RepositoryError> {
        Ok(WorkflowExecution {
            job_id: parse_uuid(&self.job_id)?,
            total_steps: self.total_steps as u32,
            current_step: self.current_step as u32,
            status: parse_enum(&self.status)?,
            input: from_json(&self.input, "execution input")?,
            checkpoints,
            retry_count: self.retry_count as u32,
            last_failure: self
                .last_failure
                .as_deref()
                .map(|s| from_json::<StepFailure>(s, "last failure"))
                .transpose()?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct CheckpointRow {
    step_index: i64,
    step_name: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_index: row.try_get("step_index")?,
            step_name: row.try_get("step_name")?,
            status: row.try_get("status")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<StepCheckpoint, RepositoryError> {
        Ok(StepCheckpoint {
            step_index: self.step_index as u32,
            step_name: self.step_name,
            status: parse_enum(&self.status)?,
            output: self
                .output
                .as_deref()
                .map(|s| from_json(s, "step output"))
                .transpose()?,
            error: self
                .error
                .as_deref()
                .map(|s| from_json(s, "step error"))
                .transpose()?,
            started_at: parse_datetime(&self.started_at)?,
            completed_at: parse_datetime(&self.completed_at)?,
        })
    }
}

impl ExecutionRepository for SqliteStore {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let last_failure = execution
            .last_failure
            .as_ref()
            .map(|f| to_json(f, "last failure"))
            .transpose()?;

        sqlx::query(
            r#"INSERT INTO workflow_executions
               (job_id, total_steps, current_step, status, input, retry_count, last_failure,
                created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.job_id.to_string())
        .bind(execution.total_steps as i64)
        .bind(execution.current_step as i64)
        .bind(execution.status.as_str())
        .bind(to_json(&execution.input, "execution input")?)
        .bind(execution.retry_count as i64)
        .bind(last_failure)
        .bind(format_datetime(&execution.created_at))
        .bind(format_datetime(&execution.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!(
                    "execution for job {} already exists",
                    execution.job_id
                ))
            } else if is_foreign_key_violation(&e) {
                RepositoryError::NotFound
            } else {
                query_err(e)
            }
        })?;

        Ok(())
    }

    async fn get_execution(&self, job_id: Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT job_id, total_steps, current_step, status, input, retry_count, last_failure,
                      created_at, updated_at
               FROM workflow_executions WHERE job_id = ?"#,
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let header = ExecutionRow::from_row(&row).map_err(query_err)?;

        let rows = sqlx::query(
            r#"SELECT step_index, step_name, status, output, error, started_at, completed_at
               FROM step_checkpoints WHERE job_id = ? ORDER BY step_index ASC"#,
        )
        .bind(job_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let mut checkpoints = BTreeMap::new();
        for row in &rows {
            let checkpoint = CheckpointRow::from_row(row)
                .map_err(query_err)?
                .into_checkpoint()?;
            checkpoints.insert(checkpoint.step_index, checkpoint);
        }

        Ok(Some(header.into_execution(checkpoints)?))
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let last_failure = execution
            .last_failure
            .as_ref()
            .map(|f| to_json(f, "last failure"))
            .transpose()?;

        let result = sqlx::query(
            r#"UPDATE workflow_executions SET
                 total_steps = ?, current_step = ?, status = ?, retry_count = ?,
                 last_failure = ?, updated_at = ?
               WHERE job_id = ?"#,
        )
        .bind(execution.total_steps as i64)
        .bind(execution.current_step as i64)
        .bind(execution.status.as_str())
        .bind(execution.retry_count as i64)
        .bind(last_failure)
        .bind(format_datetime(&execution.updated_at))
        .bind(execution.job_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), RepositoryError> {
        let output = checkpoint
            .output
            .as_ref()
            .map(|v| to_json(v, "step output"))
            .transpose()?;
        let error = checkpoint
            .error
            .as_ref()
            .map(|f| to_json(f, "step error"))
            .transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO step_checkpoints
               (job_id, step_index, step_name, status, output, error, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(job_id, step_index) DO UPDATE SET
                 step_name = excluded.step_name,
                 status = excluded.status,
                 output = excluded.output,
                 error = excluded.error,
                 started_at = excluded.started_at,
                 completed_at = excluded.completed_at
               WHERE step_checkpoints.status != 'completed'"#,
        )
        .bind(job_id.to_string())
        .bind(checkpoint.step_index as i64)
        .bind(&checkpoint.step_name)
        .bind(checkpoint.status.as_str())
        .bind(output)
        .bind(error)
        .bind(format_datetime(&checkpoint.started_at))
        .bind(format_datetime(&checkpoint.completed_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                RepositoryError::NotFound
            } else {
                query_err(e)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} of job {job_id} is already completed",
                checkpoint.step_index
            )));
        }
        Ok(())
    }
}
