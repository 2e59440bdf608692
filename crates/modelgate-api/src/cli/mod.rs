//! CLI command definitions for the `mgate` binary.
//!
//! Uses clap derive macros for argument parsing. Every command honours the
//! global `--json` flag.

pub mod job;
pub mod pipeline;
pub mod queue;
pub mod quota;
pub mod worker;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use modelgate_types::job::{JobKind, JobStatus};
use uuid::Uuid;

/// Admit and run model jobs without letting two of them hold the same model.
#[derive(Parser)]
#[command(name = "mgate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv and more for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a job for a pipeline.
    Submit {
        /// Pipeline name.
        pipeline: String,

        /// Job kind (workflow or simple).
        #[arg(long, default_value = "workflow")]
        kind: JobKind,

        /// JSON input passed to the first step.
        #[arg(long)]
        input: Option<String>,

        /// Run the job in this process and wait for it to stop. Without
        /// this flag the job is accepted and left to a worker.
        #[arg(long)]
        wait: bool,
    },

    /// Show the status and checkpoints of a job.
    Status {
        /// Job UUID.
        job_id: Uuid,
    },

    /// Cancel a job.
    Cancel {
        /// Job UUID.
        job_id: Uuid,
    },

    /// List jobs.
    #[command(alias = "ls")]
    Jobs {
        /// Only jobs in this status (e.g. queued, pending_retry).
        #[arg(long)]
        status: Option<JobStatus>,

        /// Maximum number of jobs to show.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Show queue events for a job, or the most recent events.
    Events {
        /// Job UUID (omit for recent events across all jobs).
        job_id: Option<Uuid>,

        /// Number of recent events when no job is given.
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show jobs currently holding models.
    Active,

    /// List registered pipelines.
    Pipelines,

    /// Run one retry sweep and wait for resumed jobs.
    Sweep,

    /// Repair the active set and admit whatever fits.
    Reconcile,

    /// Run recovery, the periodic sweeper and pending admission until Ctrl+C.
    Worker {
        /// Seconds between checks for newly accepted jobs.
        #[arg(long, default_value = "5")]
        poll_secs: u64,
    },

    /// Manage per-model usage limits.
    Quota {
        #[command(subcommand)]
        action: quota::QuotaCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
