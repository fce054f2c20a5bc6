use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trendscout_core::SystemClock;
use trendscout_pipeline::{render_markdown, write_report, Pipeline, PipelineConfig, RunManager};
use trendscout_storage::{CacheStore, Database};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "trendscout")]
#[command(about = "Trend to catalog recommendation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one pipeline run and write its report
    Run {
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        top_n: Option<usize>,
    },
    /// Create or upgrade the database schema
    Migrate,
    /// Run the pipeline on TRENDSCOUT_RUN_CRON until interrupted
    Schedule,
    /// Render the report for a finished run
    Report {
        run_id: Uuid,
        /// Print the markdown instead of writing a file
        #[arg(long)]
        stdout: bool,
    },
    /// Delete a run and every row it owns
    DeleteRun { run_id: Uuid },
    /// Remove expired HTTP cache entries
    PurgeCache,
}

fn init_tracing() {
    let default_level = std::env::var("TRENDSCOUT_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> Result<PipelineConfig> {
    PipelineConfig::from_env().with_rules_from_workspace()
}

async fn open_database(config: &PipelineConfig) -> Result<Database> {
    Database::connect(&config.database_url, config.db_max_connections).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        region: None,
        top_n: None,
    }) {
        Commands::Run { region, top_n } => {
            let mut config = load_config()?;
            if let Some(region) = region {
                config.region = region.to_ascii_uppercase();
            }
            if let Some(top_n) = top_n {
                config.top_n = top_n;
            }
            let pipeline = Pipeline::from_config(config).await?;
            let summary = pipeline.run_once().await?;
            let report = pipeline.write_report(summary.run_id).await?;
            println!(
                "run complete: run_id={} region={} keywords={} candidates={} \
                 recommendations={} report={}",
                summary.run_id,
                summary.region,
                summary.keywords,
                summary.candidates,
                summary.recommendations,
                report.display()
            );
        }
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            open_database(&config).await?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Schedule => {
            let mut config = load_config()?;
            config.scheduler_enabled = true;
            let cron = config.run_cron.clone();
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { run_id, stdout } => {
            let config = PipelineConfig::from_env();
            let db = open_database(&config).await?;
            let run = RunManager::new(db.clone(), Arc::new(SystemClock))
                .get(run_id)
                .await?;
            let details = db.list_recommendations(run_id).await?;
            if stdout {
                print!("{}", render_markdown(&run, &details));
            } else {
                let path = write_report(&config.reports_dir, &run, &details).await?;
                println!("report written: {}", path.display());
            }
        }
        Commands::DeleteRun { run_id } => {
            let config = PipelineConfig::from_env();
            let db = open_database(&config).await?;
            let removed = RunManager::new(db, Arc::new(SystemClock)).delete(run_id).await?;
            println!(
                "run deleted: run_id={run_id} trend_snapshots={} keywords={} \
                 catalog_results={} scores={} recommendations={}",
                removed.trend_snapshots,
                removed.keywords,
                removed.catalog_results,
                removed.scores,
                removed.recommendations
            );
        }
        Commands::PurgeCache => {
            let config = PipelineConfig::from_env();
            let db = open_database(&config).await?;
            let purged = CacheStore::new(db, Arc::new(SystemClock)).purge_expired().await?;
            println!("expired cache entries removed: {purged}");
        }
    }

    Ok(())
}
