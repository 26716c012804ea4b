use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grantscout_core::Importer;
use grantscout_storage::{HttpFetcher, MemoryImporter, PgImporter};
use grantscout_sync::{
    export, refresh_statuses, Engine, RefreshSummary, RunSummary, ScrapeResult, Scheduler, SourceRegistry,
    StatusManager, SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "grantscout")]
#[command(about = "GrantScout funding opportunity pipeline")]
struct Cli {
    /// Source registry file (defaults to GRANTSCOUT_SOURCES or ./sources.yaml).
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl sources once and import the results.
    Scrape {
        #[arg(long)]
        source: Option<String>,
        /// Skip the import step and print (or write) the records as JSON.
        #[arg(long)]
        dry_run: bool,
        #[arg(long, requires = "dry_run")]
        output: Option<PathBuf>,
    },
    /// List configured sources.
    Sources,
    /// Run on the configured schedule until interrupted.
    Schedule {
        #[arg(long)]
        once: bool,
        #[arg(long, requires = "once")]
        source: Option<String>,
    },
    /// Expire past-deadline records and send stale rolling records back to review.
    UpdateStatuses {
        /// Report the changes without writing them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn importer(config: &SyncConfig) -> Result<Arc<dyn Importer>> {
    match config.database_url.as_deref() {
        Some(url) => Ok(Arc::new(PgImporter::connect(url).await?)),
        None => {
            warn!("DATABASE_URL not set; records are kept in memory for this run only");
            Ok(Arc::new(MemoryImporter::new()))
        }
    }
}

async fn build_engine(config: &SyncConfig) -> Result<Engine> {
    let registry = SourceRegistry::load(&config.sources_path)?;
    let http = HttpFetcher::new(config.http_client_config())?;
    let importer = importer(config).await?;
    Ok(Engine::new(registry, Arc::new(http), importer)?)
}

fn print_result(result: &ScrapeResult) {
    println!("sources processed: {}", result.sources_processed);
    println!("sources failed:    {}", result.sources_failed);
    println!("records found:     {}", result.records_found);
    println!("records created:   {}", result.records_created);
    println!("records updated:   {}", result.records_updated);
    println!("records skipped:   {}", result.records_skipped);
    println!("records rejected:  {}", result.records_rejected);
    let failed: Vec<_> = result.source_results.iter().filter(|s| !s.success).collect();
    if !failed.is_empty() {
        println!("failed sources:");
        for source in failed {
            println!("  - {}: {}", source.source_name, source.errors.join(", "));
        }
    }
}

fn print_run_summary(summary: &RunSummary) {
    print_result(&summary.result);
    for (label, ids) in [
        ("timed out", &summary.timed_out),
        ("deferred", &summary.deferred),
        ("not started", &summary.not_started),
    ] {
        if !ids.is_empty() {
            println!("{label}: {}", ids.join(", "));
        }
    }
}

fn print_refresh(summary: &RefreshSummary) {
    let verb = if summary.dry_run { "would mark" } else { "marked" };
    for change in &summary.changes {
        println!("{verb} {} as {}: {}", change.title, change.to, change.reason);
    }
    println!(
        "{} {} expired opportunities and {} needing review ({} examined)",
        if summary.dry_run { "would update" } else { "updated" },
        summary.expired(),
        summary.needs_review(),
        summary.examined
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = SyncConfig::from_env();
    if let Some(path) = cli.sources {
        config.sources_path = path;
    }

    match cli.command {
        Commands::Scrape {
            source,
            dry_run,
            output,
        } => {
            let engine = build_engine(&config).await?;
            let result = engine.run(source.as_deref(), dry_run).await?;
            if dry_run {
                match output {
                    Some(path) => {
                        export::write_json(&path, &result.records).await?;
                        println!("wrote {} records to {}", result.records.len(), path.display());
                    }
                    None => println!("{}", export::to_json(&result.records)?),
                }
            }
            print_result(&result);
        }
        Commands::Sources => {
            let engine = build_engine(&config).await?;
            for source in engine.sources().await {
                let state = if source.is_active { "active" } else { "inactive" };
                let attention = if source.needs_attention { " (needs attention)" } else { "" };
                println!(
                    "{:<16} {:<14} {:<12} {state}{attention}  {}",
                    source.source_id,
                    source.category.as_str(),
                    source.adapter,
                    source.source_name
                );
            }
        }
        Commands::Schedule { once, source } => {
            let engine = Arc::new(build_engine(&config).await?);
            let scheduler = Arc::new(Scheduler::new(engine, config.schedule.clone()));

            let stopper = Arc::clone(&scheduler);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.stop();
                }
            });

            if once {
                let summary = scheduler.run_once(source.as_deref()).await?;
                print_run_summary(&summary);
            } else {
                scheduler
                    .run_scheduled(|summary| {
                        print_run_summary(summary);
                    })
                    .await;
            }
            let health = scheduler.get_health_status().await;
            if !health.is_empty() {
                println!("{}", serde_json::to_string_pretty(&health)?);
            }
        }
        Commands::UpdateStatuses { dry_run } => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to update stored statuses")?;
            let store = PgImporter::connect(url).await?;
            let today = chrono::Local::now().date_naive();
            let summary = refresh_statuses(&store, &StatusManager::default(), today, dry_run).await?;
            print_refresh(&summary);
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let importer = PgImporter::connect(url).await?;
            importer.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
