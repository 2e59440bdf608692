//! `mgate quota`: per-model usage limits.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use modelgate_types::error::RepositoryError;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum QuotaCommand {
    /// Set the usage limit of a provider/model pair. Usage is kept.
    Set {
        provider: String,
        model: String,
        limit: u64,

        /// Store the limit but do not enforce it.
        #[arg(long)]
        disabled: bool,
    },

    /// Zero the usage counter of a provider/model pair.
    Reset { provider: String, model: String },

    /// Show limits and usage.
    #[command(alias = "ls")]
    List,
}

pub async fn handle_quota_command(cmd: QuotaCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        QuotaCommand::Set {
            provider,
            model,
            limit,
            disabled,
        } => {
            state
                .quotas
                .set_quota(&provider, &model, limit, !disabled)
                .await
                .context("Failed to set quota")?;
            if json {
                let out = serde_json::json!({
                    "provider": provider,
                    "model": model,
                    "limit": limit,
                    "enabled": !disabled,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} Quota for {}:{} set to {limit}{}",
                    style("*").green().bold(),
                    style(&provider).cyan(),
                    style(&model).cyan(),
                    if disabled { " (disabled)" } else { "" }
                );
                println!();
            }
            Ok(())
        }
        QuotaCommand::Reset { provider, model } => {
            match state.quotas.reset_quota(&provider, &model).await {
                Ok(()) => {}
                Err(RepositoryError::NotFound) => {
                    anyhow::bail!("No quota configured for {provider}:{model}")
                }
                Err(err) => return Err(anyhow::Error::new(err).context("Failed to reset quota")),
            }
            if json {
                let out = serde_json::json!({
                    "provider": provider,
                    "model": model,
                    "used": 0,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!(
                    "  {} Usage for {}:{} reset",
                    style("*").green().bold(),
                    style(&provider).cyan(),
                    style(&model).cyan()
                );
                println!();
            }
            Ok(())
        }
        QuotaCommand::List => {
            let quotas = state.quotas.list_quotas().await.context("Failed to list quotas")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&quotas)?);
                return Ok(());
            }
            if quotas.is_empty() {
                println!();
                println!("  No quotas configured; every model is unlimited.");
                println!();
                return Ok(());
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Provider").fg(Color::Cyan),
                    Cell::new("Model"),
                    Cell::new("Used"),
                    Cell::new("Limit"),
                    Cell::new("Enforced"),
                ]);
            for q in &quotas {
                let used = if q.enabled && q.used >= q.limit {
                    Cell::new(q.used).fg(Color::Red)
                } else {
                    Cell::new(q.used)
                };
                table.add_row(vec![
                    Cell::new(&q.provider),
                    Cell::new(&q.model),
                    used,
                    Cell::new(q.limit),
                    Cell::new(if q.enabled { "yes" } else { "no" }),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }
    }
}
