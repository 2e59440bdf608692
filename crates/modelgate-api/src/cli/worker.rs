//! Long-running worker and in-process wait helpers.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use console::style;
use modelgate_types::event::JobEvent;
use tokio::sync::broadcast;

use crate::state::{AppState, ConcreteEngine};

/// Wait until every job launched by this process stops. Ctrl+C parks the
/// running jobs instead.
pub async fn wait_or_interrupt(engine: &ConcreteEngine) {
    tokio::select! {
        _ = engine.wait_idle() => {}
        _ = shutdown_signal() => {
            tracing::info!("interrupted, parking running jobs");
            engine.shutdown().await;
        }
    }
}

/// Recover, then keep admitting and sweeping until Ctrl+C or SIGTERM.
pub async fn run(state: &AppState, poll_secs: u64, json: bool) -> Result<()> {
    let engine = &state.engine;
    let events = engine.event_bus().subscribe();
    let printer = tokio::spawn(print_events(events, json));

    let report = engine
        .recover(Utc::now())
        .await
        .context("Startup recovery failed")?;
    if !json {
        println!();
        println!(
            "  {} Worker started ({} pipelines, sweep every {}s)",
            style("*").green().bold(),
            engine.registry().len(),
            state.config.sweeper.interval_secs
        );
        println!(
            "  Recovered: {} released, {} requeued, {} failed, {} admitted",
            report.reconcile.released.len(),
            report.reconcile.requeued.len(),
            report.reconcile.failed.len(),
            report.admitted.len() + report.reconcile.promoted.len()
        );
        println!("  {}", style("Press Ctrl+C to stop").dim());
        println!();
    }

    let sweeper = engine.spawn_sweeper();
    let mut ticker = tokio::time::interval(Duration::from_secs(poll_secs.max(1)));
    ticker.tick().await;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                if let Err(err) = engine.admit_pending().await {
                    tracing::error!(error = %err, "pending admission failed");
                }
            }
        }
    }

    engine.shutdown().await;
    if let Err(err) = sweeper.await {
        tracing::warn!(error = %err, "sweeper task ended abnormally");
    }
    printer.abort();

    if !json {
        println!();
        println!("  Worker stopped.");
    }
    Ok(())
}

async fn print_events(mut rx: broadcast::Receiver<JobEvent>, json: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(err) => tracing::warn!(error = %err, "failed to encode event"),
                    }
                } else {
                    println!("  {}", describe(&event));
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn describe(event: &JobEvent) -> String {
    let id = style(event.job_id()).cyan();
    match event {
        JobEvent::Admitted { models, .. } => format!("{id} admitted [{}]", models.join(", ")),
        JobEvent::Blocked { reason, .. } => format!("{id} queued: {reason}"),
        JobEvent::StepStarted {
            step_index,
            step_name,
            ..
        } => format!("{id} step {step_index} ({step_name}) started"),
        JobEvent::StepCompleted {
            step_index,
            duration_ms,
            ..
        } => format!("{id} step {step_index} done in {duration_ms}ms"),
        JobEvent::StepFailed {
            step_index,
            retryable,
            error,
            ..
        } => {
            let kind = if *retryable { "retryable" } else { "hard" };
            format!("{id} step {step_index} failed ({kind}): {error}")
        }
        JobEvent::Parked {
            retry_count,
            earliest_retry_at,
            ..
        } => match earliest_retry_at {
            Some(at) => format!(
                "{id} parked (retry {retry_count}, not before {})",
                at.format("%H:%M:%S")
            ),
            None => format!("{id} parked (retry {retry_count})"),
        },
        JobEvent::Completed { .. } => format!("{id} {}", style("completed").green()),
        JobEvent::Failed { error, .. } => format!("{id} {}: {error}", style("failed").red()),
        JobEvent::Cancelled { .. } => format!("{id} cancelled"),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
