//! Job subcommands: submit, status, cancel, jobs and events.

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use modelgate_core::coordinator::{CancelOutcome, CoordinatorError};
use modelgate_core::repository::{EventLog, JobFilter, JobRepository};
use modelgate_core::service::EngineError;
use modelgate_types::event::QueueEvent;
use modelgate_types::execution::CheckpointStatus;
use modelgate_types::job::{JobKind, JobSpec, JobStatus, JobStatusView};
use uuid::Uuid;

use super::worker::wait_or_interrupt;
use crate::state::AppState;

pub async fn submit(
    state: &AppState,
    pipeline: String,
    kind: JobKind,
    input: Option<&str>,
    wait: bool,
    json: bool,
) -> Result<()> {
    let input = match input {
        Some(raw) => serde_json::from_str(raw).context("Invalid JSON input")?,
        None => serde_json::Value::Null,
    };
    let spec = JobSpec {
        kind,
        pipeline,
        input,
    };

    let job_id = if wait {
        let id = state.engine.submit(spec).await.context("Failed to submit job")?;
        wait_or_interrupt(&state.engine).await;
        id
    } else {
        state
            .engine
            .enqueue_only(spec)
            .await
            .context("Failed to submit job")?
    };

    let view = state.engine.get_status(job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Submitted job for pipeline '{}'",
        style("*").green().bold(),
        style(&view.pipeline).cyan()
    );
    println!("  Job ID: {job_id}");
    println!("  Status: {}", status_style(view.status));
    if let Some(reason) = &view.conflict_reason {
        println!("  Waiting: {reason}");
    }
    if let Some(error) = &view.error {
        println!("  Error: {}", style(error).red());
    }
    if !wait {
        println!();
        println!("  Run it with: {}", style("mgate worker").dim());
    }
    println!();
    Ok(())
}

pub async fn status(state: &AppState, job_id: Uuid, json: bool) -> Result<()> {
    let view = state
        .engine
        .get_status(job_id)
        .await
        .with_context(|| format!("Failed to get status of job {job_id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    print_status(&view);
    Ok(())
}

fn print_status(view: &JobStatusView) {
    println!();
    println!(
        "  Job {} ({} / {})",
        style(view.job_id).cyan(),
        view.kind,
        view.pipeline
    );
    println!("  Status: {}", status_style(view.status));
    println!(
        "  Progress: step {} of {}",
        view.current_step.min(view.total_steps),
        view.total_steps
    );
    println!("  Retries: {}", view.retry_count);
    if let Some(holder) = view.blocked_by {
        println!("  Blocked by: {holder}");
    }
    if let Some(reason) = &view.conflict_reason {
        println!("  Conflict: {reason}");
    }
    if let Some(error) = &view.error {
        println!("  Error: {}", style(error).red());
    }

    if !view.checkpoints.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("#").fg(Color::Cyan),
                Cell::new("Step"),
                Cell::new("Status"),
                Cell::new("Finished"),
                Cell::new("Error"),
            ]);
        for cp in &view.checkpoints {
            let color = match cp.status {
                CheckpointStatus::Completed => Color::Green,
                CheckpointStatus::FailedRetryable => Color::Yellow,
                CheckpointStatus::FailedHard => Color::Red,
            };
            table.add_row(vec![
                Cell::new(cp.step_index),
                Cell::new(&cp.step_name),
                Cell::new(cp.status).fg(color),
                Cell::new(cp.completed_at.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(cp.error.as_ref().map(|e| e.to_string()).unwrap_or_default()),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();
}

pub async fn cancel(state: &AppState, job_id: Uuid, json: bool) -> Result<()> {
    let outcome = state.engine.cancel(job_id).await.map_err(|e| match e {
        EngineError::Coordinator(CoordinatorError::JobNotFound(id)) => {
            anyhow::anyhow!("Job {id} not found")
        }
        other => anyhow::Error::new(other).context("Failed to cancel job"),
    })?;

    let (result, message) = match &outcome {
        CancelOutcome::Cancelled => ("cancelled", "Job cancelled".to_string()),
        CancelOutcome::Running => (
            "running",
            "Job is running in another process; it was not interrupted".to_string(),
        ),
        CancelOutcome::AlreadyFinished(status) => {
            ("finished", format!("Job already finished ({status})"))
        }
    };

    if json {
        let out = serde_json::json!({
            "job_id": job_id.to_string(),
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        let marker = match outcome {
            CancelOutcome::Cancelled => style("*").green().bold(),
            _ => style("!").yellow().bold(),
        };
        println!();
        println!("  {marker} {message}");
        println!();
    }
    Ok(())
}

pub async fn list(
    state: &AppState,
    status: Option<JobStatus>,
    limit: Option<i64>,
    json: bool,
) -> Result<()> {
    if limit.is_some_and(|l| l <= 0) {
        bail!("--limit must be positive");
    }
    let jobs = state
        .store
        .list_jobs(&JobFilter { status, limit })
        .await
        .context("Failed to list jobs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Pipeline"),
            Cell::new("Status"),
            Cell::new("Models"),
            Cell::new("Created"),
        ]);
    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(job.kind),
            Cell::new(&job.pipeline),
            Cell::new(job.status).fg(status_color(job.status)),
            Cell::new(job.required_models.join(", ")),
            Cell::new(job.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn events(
    state: &AppState,
    job_id: Option<Uuid>,
    limit: i64,
    json: bool,
) -> Result<()> {
    let events = match job_id {
        Some(id) => state.store.events_for_job(id).await,
        None => state.store.recent_events(limit.max(1)).await,
    }
    .context("Failed to read queue events")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!();
        println!("  No events.");
        println!();
        return Ok(());
    }

    println!();
    println!("{}", events_table(&events, job_id.is_none()));
    println!();
    Ok(())
}

fn events_table(events: &[QueueEvent], with_job: bool) -> Table {
    let mut header = vec![Cell::new("Time").fg(Color::Cyan)];
    if with_job {
        header.push(Cell::new("Job"));
    }
    header.extend([Cell::new("Event"), Cell::new("Models"), Cell::new("Detail")]);

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);

    for event in events {
        let mut row = vec![Cell::new(event.created_at.format("%Y-%m-%d %H:%M:%S"))];
        if with_job {
            row.push(Cell::new(event.job_id));
        }
        row.extend([
            Cell::new(event.event_type),
            Cell::new(event.models.join(", ")),
            Cell::new(event.conflict_reason.as_deref().unwrap_or("")),
        ]);
        table.add_row(row);
    }
    table
}

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Completed => Color::Green,
        JobStatus::Running => Color::Cyan,
        JobStatus::Queued | JobStatus::PendingRetry => Color::Yellow,
        JobStatus::Failed => Color::Red,
        JobStatus::Pending | JobStatus::Cancelled => Color::Grey,
    }
}

fn status_style(status: JobStatus) -> console::StyledObject<JobStatus> {
    match status {
        JobStatus::Completed => style(status).green(),
        JobStatus::Running => style(status).cyan(),
        JobStatus::Queued | JobStatus::PendingRetry => style(status).yellow(),
        JobStatus::Failed => style(status).red(),
        JobStatus::Pending | JobStatus::Cancelled => style(status).dim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelgate_types::event::QueueEventType;

    #[test]
    fn events_table_adds_job_column_for_recent_events() {
        let job_id = Uuid::now_v7();
        let holder = Uuid::now_v7();
        let events = vec![
            QueueEvent::new(job_id, JobKind::Workflow, QueueEventType::Blocked, vec![
                "gen-x".to_string(),
            ])
            .with_conflict(Some(holder), "gen-x in use"),
        ];

        let rendered = events_table(&events, true).to_string();
        assert!(rendered.contains(&job_id.to_string()));
        assert!(rendered.contains("gen-x in use"));

        let rendered = events_table(&events, false).to_string();
        assert!(!rendered.contains(&job_id.to_string()));
    }
}
