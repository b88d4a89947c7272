use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pfin_sync::{SyncConfig, SyncPipeline, TableRegistry, TABLE_REGISTRY_FILE};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pfin-cli")]
#[command(about = "Personal finance ETL command-line interface")]
struct Cli {
    /// Log at debug level when RUST_LOG is unset.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every enabled table once, or only the tables given with --table.
    Sync {
        #[arg(long = "table")]
        tables: Vec<String>,
    },
    /// List the tables declared in tables.yaml.
    Tables,
    /// Run the nightly sync on its cron schedule until interrupted.
    Schedule,
    /// Summarize the most recent run reports.
    ReportDaily {
        #[arg(long, default_value_t = 7)]
        runs: usize,
    },
}

fn init_tracing(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

fn workspace_root() -> PathBuf {
    std::env::var("PFIN_WORKSPACE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command.unwrap_or(Commands::Sync { tables: Vec::new() }) {
        Commands::Sync { tables } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
            let summary = pipeline.run_tables(&tables).await?;
            println!(
                "sync complete: run_id={} tables={} inserted={} updated={} failed={} reports={}",
                summary.run_id,
                summary.tables.len(),
                summary.inserted,
                summary.updated,
                summary.failed_tables,
                summary.reports_dir
            );
            if summary.failed_tables > 0 {
                let failed: Vec<_> = summary.failed().map(|t| t.table.as_str()).collect();
                bail!("{} table(s) failed: {}", failed.len(), failed.join(", "));
            }
        }
        Commands::Tables => {
            let registry = TableRegistry::load(&workspace_root().join(TABLE_REGISTRY_FILE)).await?;
            for table in &registry.tables {
                println!(
                    "{}\tkey=({})\tupdate={}\tfeed={:?}{}",
                    table.qualified_name(),
                    table.natural_key,
                    table
                        .update_key
                        .as_ref()
                        .map(|k| format!("({k})"))
                        .unwrap_or_else(|| "insert-only".to_string()),
                    table.feed.kind,
                    if table.enabled { "" } else { "\tdisabled" }
                );
            }
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler did not start");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::ReportDaily { runs } => {
            let markdown = pfin_sync::report_daily_markdown(runs, Some(workspace_root()))?;
            println!("{markdown}");
        }
    }

    Ok(())
}
