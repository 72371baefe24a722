use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bountyping_adapters::{adapter_for_platform, JsonFileSeedAdapter, PlatformAdapter};
use bountyping_core::ScrapeOutcome;
use bountyping_storage::{PgProgramStore, ProgramStore};
use bountyping_sync::{invoke_adapter, IngestContext, InvocationReport, PlatformRegistry, Scheduler, SyncConfig, SyncError};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DB_POOL_SIZE: u32 = 5;

#[derive(Debug, Parser)]
#[command(name = "bountyping")]
#[command(about = "Bug bounty program aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scrape scheduler until interrupted.
    Run,
    /// Scrape one platform now.
    Scrape {
        platform: String,
        /// Send a notification for detected changes.
        #[arg(long)]
        notify: bool,
    },
    /// Import bulk seed sources, or a local list in the same format.
    Seed {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Show recent scrape logs.
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bountyping=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (ctx, registry) = build_context(config).await?;
            let scheduler = Scheduler::from_registry(ctx, &registry)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; finishing current invocation");
                    let _ = shutdown_tx.send(true);
                }
            });
            scheduler.run(shutdown_rx).await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Scrape { platform, notify } => {
            let (ctx, _) = build_context(config).await?;
            let adapter = adapter_for_platform(&platform, &ctx.config.adapter_options())
                .ok_or_else(|| SyncError::UnknownPlatform(platform.clone()))?;
            let report = invoke_adapter(&ctx, adapter.as_ref(), notify).await;
            print_report(&report);
            Ok(exit_code(&[report]))
        }
        Commands::Seed { file } => {
            let (ctx, registry) = build_context(config).await?;
            let adapters: Vec<Box<dyn PlatformAdapter>> = match file {
                Some(path) => vec![Box::new(JsonFileSeedAdapter::new(path))],
                None => {
                    let options = ctx.config.adapter_options();
                    registry
                        .seed_sources()
                        .map(|entry| {
                            adapter_for_platform(&entry.platform, &options)
                                .ok_or_else(|| SyncError::UnknownPlatform(entry.platform.clone()))
                        })
                        .collect::<Result<_, _>>()?
                }
            };
            if adapters.is_empty() {
                warn!("no seed sources enabled");
            }

            let mut reports = Vec::with_capacity(adapters.len());
            for adapter in &adapters {
                let report = invoke_adapter(&ctx, adapter.as_ref(), false).await;
                print_report(&report);
                reports.push(report);
            }
            Ok(exit_code(&reports))
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs { limit } => {
            let store = connect(&config).await?;
            let logs = store.recent_logs(limit).await.context("loading scrape logs")?;
            for log in logs {
                println!(
                    "{} {:<16} {:<8} fetched={} new={} updated={} unchanged={} skipped={} failed={}{}",
                    log.started_at.format("%Y-%m-%d %H:%M:%S"),
                    log.platform,
                    log.outcome,
                    log.counts.fetched,
                    log.counts.created,
                    log.counts.updated,
                    log.counts.unchanged,
                    log.counts.skipped,
                    log.counts.failed,
                    log.error.map(|e| format!(" error={e}")).unwrap_or_default(),
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect(config: &SyncConfig) -> Result<PgProgramStore> {
    PgProgramStore::connect(&config.database_url, DB_POOL_SIZE)
        .await
        .with_context(|| "connecting to DATABASE_URL")
}

async fn build_context(config: SyncConfig) -> Result<(Arc<IngestContext>, PlatformRegistry)> {
    let registry = PlatformRegistry::load(&config.workspace_root).await?;
    let store: Arc<dyn ProgramStore> = Arc::new(connect(&config).await?);
    let ctx = IngestContext::new(config, &registry, store)?;
    Ok((Arc::new(ctx), registry))
}

fn print_report(report: &InvocationReport) {
    let log = &report.log;
    println!(
        "{}: {} (fetched={} new={} updated={} unchanged={} duplicates={} skipped={} failed={})",
        log.platform,
        log.outcome,
        log.counts.fetched,
        log.counts.created,
        log.counts.updated,
        log.counts.unchanged,
        log.counts.duplicates,
        log.counts.skipped,
        log.counts.failed,
    );
    if let Some(error) = &log.error {
        println!("  {error}");
    }
}

fn exit_code(reports: &[InvocationReport]) -> ExitCode {
    if reports.iter().any(|r| r.outcome() == ScrapeOutcome::Failure) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
