//! SQLite queue event log (append-only).

use modelgate_core::repository::EventLog;
use modelgate_types::error::RepositoryError;
use modelgate_types::event::QueueEvent;
use sqlx::Row;
use uuid::Uuid;

use super::store::{
    SqliteStore, format_datetime, from_json, parse_datetime, parse_enum, parse_uuid, query_err,
    to_json,
};

const EVENT_COLUMNS: &str =
    "id, job_id, job_kind, event_type, models, blocked_by, conflict_reason, metadata, created_at";

struct EventRow {
    id: String,
    job_id: String,
    job_kind: String,
    event_type: String,
    models: String,
    blocked_by: Option<String>,
    conflict_reason: Option<String>,
    metadata: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            job_kind: row.try_get("job_kind")?,
            event_type: row.try_get("event_type")?,
            models: row.try_get("models")?,
            blocked_by: row.try_get("blocked_by")?,
            conflict_reason: row.try_get("conflict_reason")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_event(self) -> Result<QueueEvent, RepositoryError> {
        Ok(QueueEvent {
            id: parse_uuid(&self.id)?,
            job_id: parse_uuid(&self.job_id)?,
            job_kind: parse_enum(&self.job_kind)?,
            event_type: parse_enum(&self.event_type)?,
            models: from_json(&self.models, "event models")?,
            blocked_by: self.blocked_by.as_deref().map(parse_uuid).transpose()?,
            conflict_reason: self.conflict_reason,
            metadata: from_json(&self.metadata, "event metadata")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn rows_to_events(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<QueueEvent>, RepositoryError> {
    rows.iter()
        .map(|row| EventRow::from_row(row).map_err(query_err)?.into_event())
        .collect()
}

impl EventLog for SqliteStore {
    async fn append_event(&self, event: &QueueEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO queue_events
               (id, job_id, job_kind, event_type, models, blocked_by, conflict_reason, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(event.id.to_string())
        .bind(event.job_id.to_string())
        .bind(event.job_kind.to_string())
        .bind(event.event_type.as_str())
        .bind(to_json(&event.models, "event models")?)
        .bind(event.blocked_by.map(|id| id.to_string()))
        .bind(&event.conflict_reason)
        .bind(to_json(&event.metadata, "event metadata")?)
        .bind(format_datetime(&event.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(())
    }

    async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<QueueEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM queue_events WHERE job_id = ? ORDER BY created_at ASC, id ASC"
        ))
        .bind(job_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_to_events(&rows)
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<QueueEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM queue_events ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows_to_events(&rows)
    }
}
