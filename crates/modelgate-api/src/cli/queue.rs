//! Admission state subcommands: active, sweep and reconcile.

use anyhow::{Context, Result};
use chrono::Utc;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use modelgate_core::repository::ActiveStateStore;
use uuid::Uuid;

use super::worker::wait_or_interrupt;
use crate::state::AppState;

pub async fn active(state: &AppState, json: bool) -> Result<()> {
    let active = state
        .store
        .load_active()
        .await
        .context("Failed to load active state")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&active)?);
        return Ok(());
    }

    println!();
    println!(
        "  Admission mode: {}  (state version {})",
        style(state.engine.coordinator().mode()).cyan(),
        active.version
    );
    if active.jobs.is_empty() {
        println!("  No active jobs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Job").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Models"),
            Cell::new("Started"),
        ]);
    for entry in &active.jobs {
        table.add_row(vec![
            Cell::new(entry.job_id),
            Cell::new(entry.kind),
            Cell::new(entry.models.join(", ")),
            Cell::new(entry.started_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn sweep(state: &AppState, json: bool) -> Result<()> {
    let report = state
        .engine
        .sweep_once(Utc::now())
        .await
        .context("Retry sweep failed")?;
    wait_or_interrupt(&state.engine).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    if report.maintenance {
        println!(
            "  {} Maintenance flag present, sweep skipped",
            style("!").yellow().bold()
        );
        println!();
        return Ok(());
    }
    println!(
        "  {} Swept {} parked job(s)",
        style("*").green().bold(),
        report.examined
    );
    print_ids("Resumed", &report.admitted);
    print_ids("Not ready", &report.not_ready);
    print_ids("Deferred", &report.deferred);
    print_ids("Retry limit reached", &report.exhausted);
    println!();
    Ok(())
}

pub async fn reconcile(state: &AppState, json: bool) -> Result<()> {
    let report = state
        .engine
        .recover(Utc::now())
        .await
        .context("Reconciliation failed")?;
    wait_or_interrupt(&state.engine).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    if report.reconcile.is_empty() && report.admitted.is_empty() {
        println!("  {} Nothing to repair", style("*").green().bold());
        println!();
        return Ok(());
    }
    println!("  {} Reconciled active state", style("*").green().bold());
    print_ids("Released", &report.reconcile.released);
    print_ids("Requeued", &report.reconcile.requeued);
    print_ids("Failed", &report.reconcile.failed);
    print_ids("Promoted", &report.reconcile.promoted);
    print_ids("Admitted", &report.admitted);
    println!();
    Ok(())
}

fn print_ids(label: &str, ids: &[Uuid]) {
    if ids.is_empty() {
        return;
    }
    println!("  {label}:");
    for id in ids {
        println!("    {id}");
    }
}
