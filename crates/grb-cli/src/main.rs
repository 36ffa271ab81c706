use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use grb_adapters::WebhookPayload;
use grb_core::{GrabStatus, SystemClock};
use grb_sync::reconcile::{build_report, render_markdown, write_report_bundle, DEFAULT_SAMPLE_LIMIT};
use grb_sync::{start_scheduler, GrabStore, HistoryFilter, SyncConfig, SyncService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grb-cli")]
#[command(about = "Grab Reconciliation Bridge command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply the database schema.
    Migrate,
    /// Run one history sync cycle.
    Sync {
        /// Ignore stored cursors and re-read the whole lookback window.
        #[arg(long)]
        full_scan: bool,
    },
    /// Run the periodic history sync until interrupted.
    Serve,
    /// Ingest one webhook payload (JSON) from a file or stdin.
    Webhook {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Re-ingest a ledger entry, falling back to a direct indexer download.
    Recover {
        download_id: String,
        #[arg(long)]
        instance: Option<String>,
    },
    /// List ledger entries joined with the canonical store.
    History {
        #[arg(long, default_value_t = 200)]
        limit: i64,
        #[arg(long)]
        instance: Option<String>,
        #[arg(long)]
        tracker: Option<String>,
        #[arg(long)]
        download_id: Option<String>,
        /// `downloaded` or `missing`.
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// Keep every ledger row instead of the newest per identity.
        #[arg(long)]
        all: bool,
    },
    /// Compare the canonical store with the history ledger.
    Report {
        #[arg(long, default_value_t = DEFAULT_SAMPLE_LIMIT)]
        limit: i64,
        /// Also write the markdown/JSON/parquet bundle under REPORTS_DIR.
        #[arg(long)]
        write: bool,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<GrabStore> {
    GrabStore::connect(&config.database_url, Arc::new(SystemClock))
        .await
        .with_context(|| format!("opening database {}", config.database_url))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { full_scan: false }) {
        Commands::Migrate => {
            open_store(&config).await?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Sync { full_scan } => {
            let service = SyncService::from_config(&config).await?;
            match service.run_cycle(full_scan).await {
                Some(summary) => print_json(&summary)?,
                None => eprintln!("history sync already running"),
            }
        }
        Commands::Serve => {
            let service = Arc::new(SyncService::from_config(&config).await?);
            let mut sched = if config.scheduler_enabled {
                Some(start_scheduler(service.clone(), config.history.interval).await?)
            } else {
                info!("scheduler disabled; waiting for shutdown");
                None
            };
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            if let Some(sched) = sched.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
            print_json(&service.status().await)?;
        }
        Commands::Webhook { file } => {
            let body = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut body = String::new();
                    std::io::stdin()
                        .read_to_string(&mut body)
                        .context("reading webhook payload from stdin")?;
                    body
                }
            };
            let payload: WebhookPayload =
                serde_json::from_str(&body).context("parsing webhook payload")?;
            let service = SyncService::from_config(&config).await?;
            let result = service
                .ingestor()
                .handle_webhook_grab(&payload, &config.webhook)
                .await;
            print_json(&result)?;
        }
        Commands::Recover {
            download_id,
            instance,
        } => {
            let service = SyncService::from_config(&config).await?;
            let ingestor = service.ingestor();
            let Some(entry) = ingestor
                .store()
                .get_history_record(&download_id, instance.as_deref())
                .await?
            else {
                bail!("no history entry for download id {download_id}");
            };
            let result = ingestor
                .recover_from_history(
                    &entry,
                    config.history.min_score,
                    config.history.strict_hash,
                    true,
                )
                .await;
            print_json(&result)?;
        }
        Commands::History {
            limit,
            instance,
            tracker,
            download_id,
            status,
            source,
            all,
        } => {
            let status = match status.as_deref() {
                Some(raw) => Some(
                    GrabStatus::parse(raw)
                        .with_context(|| format!("unknown status {raw:?}"))?,
                ),
                None => None,
            };
            let filter = HistoryFilter {
                limit,
                instance,
                tracker,
                download_id,
                status,
                source,
                dedup: !all,
            };
            let store = open_store(&config).await?;
            print_json(&store.list_history(&filter).await?)?;
        }
        Commands::Report { limit, write } => {
            let store = open_store(&config).await?;
            let report = build_report(&store, limit).await?;
            println!("{}", render_markdown(&report));
            if write {
                let bundle = write_report_bundle(&report, &config.reports_dir).await?;
                println!("report bundle: {}", bundle.dir.display());
            }
        }
    }

    Ok(())
}
