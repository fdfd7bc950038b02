// ABOUTME: CLI entry point for view-materializer
// ABOUTME: Parses commands, initializes logging and TLS policy, routes to handlers

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use view_materializer::commands::{self, AdHocJob, ConfigOverrides, SyncOptions};

#[derive(Parser)]
#[command(name = "view-materializer")]
#[command(
    about = "Incrementally materialize database views into tables using change-tracking watermarks",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the TOML config (defaults to ./view-materializer.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// PostgreSQL URL or SQLite file path
    #[arg(long = "database-url", env = "MATERIALIZER_DATABASE_URL", global = true)]
    database_url: Option<String>,
    /// Keep watermarks in this JSON file
    #[arg(long = "state-file", global = true)]
    state_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct JobArgs {
    /// View to read slices from (schema.name)
    #[arg(long = "source-view")]
    source_view: Option<String>,
    /// Table to materialize into (schema.name)
    #[arg(long = "target-table")]
    target_table: Option<String>,
    /// Change function (PostgreSQL) or change-log table (SQLite)
    #[arg(long = "changes-function")]
    changes_function: Option<String>,
    /// Query returning the current change-tracking version
    #[arg(long = "version-query")]
    version_query: Option<String>,
    /// Version column of a SQLite change log
    #[arg(long = "version-column")]
    version_column: Option<String>,
    /// Maximum keys merged concurrently
    #[arg(long)]
    concurrency: Option<usize>,
}

impl From<JobArgs> for AdHocJob {
    fn from(args: JobArgs) -> Self {
        AdHocJob {
            source_view: args.source_view,
            target_table: args.target_table,
            changes_function: args.changes_function,
            version_query: args.version_query,
            version_column: args.version_column,
            concurrency: args.concurrency,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Bring target tables up to date with their source views
    Sync {
        /// Only run the named job
        #[arg(long)]
        job: Option<String>,
        /// Keep running, syncing every SECS seconds until Ctrl+C
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        #[command(flatten)]
        job_args: JobArgs,
    },
    /// Show the stored watermark of each job
    Status {
        #[arg(long)]
        job: Option<String>,
        #[command(flatten)]
        job_args: JobArgs,
    },
    /// Rewind a job's watermark to force a full resync
    Reset {
        #[arg(long)]
        job: Option<String>,
        #[command(flatten)]
        job_args: JobArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    view_materializer::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    let overrides = |job_args: JobArgs| ConfigOverrides {
        config_path: cli.config.clone(),
        database_url: cli.database_url.clone(),
        state_file: cli.state_file.clone(),
        job: job_args.into(),
    };

    match cli.command {
        Commands::Sync {
            job,
            interval,
            job_args,
        } => {
            let config = commands::resolve_config(overrides(job_args))?;
            if let Some(0) = interval {
                anyhow::bail!("--interval must be at least 1 second");
            }
            commands::sync(SyncOptions {
                config,
                job,
                interval: interval.map(Duration::from_secs),
            })
            .await
        }
        Commands::Status { job, job_args } => {
            let config = commands::resolve_config(overrides(job_args))?;
            commands::status(&config, job.as_deref()).await
        }
        Commands::Reset { job, job_args } => {
            let config = commands::resolve_config(overrides(job_args))?;
            commands::reset(&config, job.as_deref()).await
        }
    }
}
