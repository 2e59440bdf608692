//! modelgate CLI entry point.
//!
//! Binary name: `mgate`
//!
//! Parses CLI arguments, initializes tracing, storage and the job engine,
//! then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use modelgate_observe::tracing_setup::{default_filter, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(err) = init_tracing(default_filter(cli.verbose, cli.quiet), cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {err}");
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "mgate", &mut std::io::stdout());
        return Ok(());
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Submit {
            pipeline,
            kind,
            input,
            wait,
        } => cli::job::submit(&state, pipeline, kind, input.as_deref(), wait, json).await,
        Commands::Status { job_id } => cli::job::status(&state, job_id, json).await,
        Commands::Cancel { job_id } => cli::job::cancel(&state, job_id, json).await,
        Commands::Jobs { status, limit } => cli::job::list(&state, status, limit, json).await,
        Commands::Events { job_id, limit } => cli::job::events(&state, job_id, limit, json).await,
        Commands::Active => cli::queue::active(&state, json).await,
        Commands::Pipelines => cli::pipeline::list(&state, json),
        Commands::Sweep => cli::queue::sweep(&state, json).await,
        Commands::Reconcile => cli::queue::reconcile(&state, json).await,
        Commands::Worker { poll_secs } => cli::worker::run(&state, poll_secs, json).await,
        Commands::Quota { action } => {
            cli::quota::handle_quota_command(action, &state, json).await
        }
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
