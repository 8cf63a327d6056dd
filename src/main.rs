use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use priceforge::config::Config;
use priceforge::database_ops::claims::{
    process_partition_index_jobs, recover_stale_provider_item_locks,
};
use priceforge::database_ops::db::Db;
use priceforge::database_ops::dedupe::{
    platforms::dedupe_platforms, titles::dedupe_titles, video_games::dedupe_video_games,
};
use priceforge::database_ops::exchange::ExchangeService;
use priceforge::database_ops::canonical::reconcile_denormalized_counts;
use priceforge::database_ops::media::{
    backfill_game_media_canonical, cleanup_unused_canonical_media,
};
use priceforge::database_ops::prices::{
    archive_old_price_partitions, daily_last_by_source, refresh_materialized_views,
};
use priceforge::database_ops::sources::{binding_credentials_enc, update_binding_credentials};
use priceforge::error::IngestError;
use priceforge::ingest::{CancellationToken, IngestPipeline};

#[derive(Parser, Debug)]
#[command(name = "priceforge", version, about = "Price ingestion and catalog admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Ingest one source by provider slug
    Ingest {
        #[arg(long)]
        source: String,
        /// Jurisdiction override ("US" or "US-CA")
        #[arg(long)]
        region: Option<String>,
    },
    /// Ingest every due source with the configured worker pool
    IngestAll,
    /// Clear provider-item locks older than STALE_LOCK_MINUTES
    RecoverLocks,
    /// Refresh the price materialized views
    RefreshMaterializedViews,
    /// Merge platform alias duplicates
    DedupePlatforms {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Merge duplicate titles within each product
    DedupeTitles {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Merge duplicate (title, platform, edition) games
    DedupeVideoGames {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Detach price partitions older than the retention window
    ArchivePartitions {
        #[arg(long)]
        months_to_keep: i32,
        /// Actually detach; default is a dry-run listing
        #[arg(long, default_value_t = false)]
        apply: bool,
    },
    /// Link legacy game_media rows to the canonical media store
    BackfillCanonicalMedia {
        #[arg(long, default_value_t = false)]
        apply: bool,
        #[arg(long, default_value_t = 1000)]
        batch: i64,
    },
    /// Claim and enrich unprocessed provider items for one source
    EnrichItems {
        #[arg(long)]
        source: String,
        /// Claim batch size (defaults to INGEST_BATCH_SIZE)
        #[arg(long)]
        batch: Option<i64>,
    },
    /// Delete canonical media rows with zero references
    CleanupCanonicalMedia {
        #[arg(long, default_value_t = 30)]
        min_age_days: i64,
        /// Actually delete; default is a dry-run count
        #[arg(long, default_value_t = false)]
        apply: bool,
    },
    /// Print the daily last-by-source price series for one offer jurisdiction
    PriceSeries {
        offer_jurisdiction_id: i64,
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Recompute trigger-maintained child counts and title arrays
    ReconcileCounts,
    /// Store or rotate a retailer-provider binding's credentials
    SetCredentials {
        #[arg(long)]
        binding: i64,
        /// Inline JSON credentials
        #[arg(long)]
        json: Option<String>,
        /// File holding an encrypted credential blob (stored base64-armored)
        #[arg(long)]
        secret_file: Option<std::path::PathBuf>,
    },
    /// Fetch the configured FX rates document and append rate history
    FxSync,
    /// Drain pending partition index jobs (CREATE INDEX CONCURRENTLY)
    ProcessPartitionIndexJobs {
        #[arg(long, default_value_t = 5)]
        max: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(e.exit_code());
        }
    };

    let db = match Db::connect(&config.database_url, config.max_db_connections).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "database unavailable");
            std::process::exit(IngestError::Fatal(e.to_string()).exit_code());
        }
    };

    let code = match run(cli.command, db, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            1
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands, db: Db, config: Config) -> anyhow::Result<i32> {
    match command {
        Commands::Migrate => {
            db.migrate().await?;
            Ok(0)
        }
        Commands::Ingest { source, region } => {
            let pipeline = IngestPipeline::new(db, config);
            let cancel = spawn_ctrlc_handler();
            match pipeline.ingest_one(&source, region, &cancel).await {
                Ok(report) => {
                    info!(
                        slug = %report.slug,
                        status = report.status,
                        records = report.records,
                        prices = report.prices_written,
                        skipped = report.skipped,
                        "ingest finished"
                    );
                    Ok(if report.status == "error" { 4 } else { 0 })
                }
                Err(e) => {
                    error!(error = %e, "ingest failed");
                    Ok(e.exit_code())
                }
            }
        }
        Commands::IngestAll => {
            let pipeline = IngestPipeline::new(db, config);
            let cancel = spawn_ctrlc_handler();
            match pipeline.ingest_all(&cancel).await {
                Ok(summary) => {
                    info!(
                        sources = summary.sources_run,
                        failed = summary.sources_failed,
                        "ingest-all finished"
                    );
                    Ok(summary.exit_code())
                }
                Err(e) => {
                    error!(error = %e, "ingest-all failed");
                    Ok(e.exit_code())
                }
            }
        }
        Commands::RecoverLocks => {
            let n = recover_stale_provider_item_locks(&db, config.stale_lock_minutes).await?;
            info!(recovered = n, "lock recovery finished");
            Ok(0)
        }
        Commands::RefreshMaterializedViews => {
            refresh_materialized_views(&db).await?;
            Ok(0)
        }
        Commands::DedupePlatforms { dry_run } => {
            let stats = dedupe_platforms(&db, !dry_run).await?;
            info!(groups = stats.groups, merged = stats.merged, "platform dedupe finished");
            Ok(0)
        }
        Commands::DedupeTitles { dry_run } => {
            let stats = dedupe_titles(&db, !dry_run).await?;
            info!(groups = stats.groups, merged = stats.merged, "title dedupe finished");
            Ok(0)
        }
        Commands::DedupeVideoGames { dry_run } => {
            let stats = dedupe_video_games(&db, !dry_run).await?;
            info!(groups = stats.groups, merged = stats.merged, "video-game dedupe finished");
            Ok(0)
        }
        Commands::ArchivePartitions {
            months_to_keep,
            apply,
        } => {
            let names = archive_old_price_partitions(&db, months_to_keep, apply).await?;
            for name in &names {
                println!("{name}");
            }
            Ok(0)
        }
        Commands::BackfillCanonicalMedia { apply, batch } => {
            let n = backfill_game_media_canonical(&db, batch, apply).await?;
            info!(rows = n, apply, "canonical media backfill finished");
            Ok(0)
        }
        Commands::EnrichItems { source, batch } => {
            let batch = batch.unwrap_or(config.ingest_batch_size);
            let pipeline = IngestPipeline::new(db, config);
            let cancel = spawn_ctrlc_handler();
            match pipeline.enrich_items(&source, batch, &cancel).await {
                Ok(report) => {
                    info!(
                        slug = %report.slug,
                        status = report.status,
                        records = report.records,
                        prices = report.prices_written,
                        "enrichment finished"
                    );
                    Ok(if report.status == "error" { 4 } else { 0 })
                }
                Err(e) => {
                    error!(error = %e, "enrichment failed");
                    Ok(e.exit_code())
                }
            }
        }
        Commands::CleanupCanonicalMedia { min_age_days, apply } => {
            let n = cleanup_unused_canonical_media(&db, min_age_days, apply).await?;
            info!(rows = n, apply, "canonical media cleanup finished");
            Ok(0)
        }
        Commands::PriceSeries {
            offer_jurisdiction_id,
            days,
        } => {
            let since = chrono::Utc::now() - chrono::Duration::days(days);
            let rows = daily_last_by_source(&db, offer_jurisdiction_id, since).await?;
            for r in rows {
                println!(
                    "{}\t{}\t{}\t{}",
                    r.bucket.date_naive(),
                    r.provider_item_id.unwrap_or_default(),
                    r.amount_minor,
                    if r.is_free { "free" } else { "" }
                );
            }
            Ok(0)
        }
        Commands::ReconcileCounts => {
            let mut conn = db.pool.acquire().await?;
            let n = reconcile_denormalized_counts(conn.as_mut()).await?;
            info!(products_fixed = n, "reconciliation finished");
            Ok(0)
        }
        Commands::SetCredentials {
            binding,
            json,
            secret_file,
        } => {
            let credentials: Option<serde_json::Value> = match json.as_deref() {
                Some(raw) => Some(serde_json::from_str(raw)?),
                None => None,
            };
            let blob = match secret_file {
                Some(path) => Some(std::fs::read(path)?),
                None => None,
            };
            if credentials.is_none() && blob.is_none() {
                error!("pass --json and/or --secret-file");
                return Ok(IngestError::Config("no credentials given".into()).exit_code());
            }
            update_binding_credentials(&db, binding, credentials.as_ref(), blob.as_deref())
                .await?;
            let stored = binding_credentials_enc(&db, binding).await?;
            info!(
                binding,
                enc_bytes = stored.map(|b| b.len()).unwrap_or(0),
                "credentials updated"
            );
            Ok(0)
        }
        Commands::FxSync => {
            let Some(url) = config.fx_provider_url.clone() else {
                error!("FX_PROVIDER_URL is not set");
                return Ok(IngestError::Config("FX_PROVIDER_URL".into()).exit_code());
            };
            let fx = ExchangeService::new(db, config.http_timeout);
            let stored = fx.sync_rates(&url).await?;
            info!(stored, "fx sync finished");
            Ok(0)
        }
        Commands::ProcessPartitionIndexJobs { max } => {
            let n = process_partition_index_jobs(&db, max).await?;
            info!(completed = n, "partition index jobs processed");
            Ok(0)
        }
    }
}

fn spawn_ctrlc_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing current records");
            handle.cancel();
        }
    });
    cancel
}
