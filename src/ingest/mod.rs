//! Ingestion pipeline: a pool of workers polls the source registry for due
//! feeds, pulls records through the adapter contract under a per-source
//! rate limit, and canonicalizes each record inside one short transaction.
//! A separate claim-based pass enriches provider items that were seeded
//! with bare external ids.

pub mod adapter;
pub mod app_lookup;
pub mod backoff;
pub mod rate_limit;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::database_ops::alerts::evaluate_alerts;
use crate::database_ops::canonical::{
    currency_for_country, currency_minor_unit, ensure_country, ensure_currency,
    ensure_jurisdiction, ensure_offer, ensure_offer_jurisdiction, ensure_platform,
    ensure_product, ensure_sellable_software, ensure_title, ensure_video_game,
};
use crate::database_ops::claims::{
    claim_provider_items_batch, finalize_provider_items, recover_stale_provider_item_locks,
};
use crate::database_ops::db::{CurrentPriceRow, Db, PriceRow};
use crate::database_ops::exchange::{btc_sats_for_amount, ExchangeService};
use crate::database_ops::media::{ensure_vg_source_media_link, upsert_game_media, GameMediaUpsert};
use crate::database_ops::prices::{ensure_price_partition, precreate_future_partition};
use crate::database_ops::sources::{
    self, claim_source_for_sync, ensure_provider_item, ensure_title_source, finish_sync,
    heartbeat_sync_lease, list_due_sources, record_sync_state, seed_provider_item, DueSource,
    SyncOutcome,
};
use crate::error::{is_check_violation, is_unique_violation, IngestError};
use crate::ingest::adapter::{RawRecord, RecordKind, SourceAdapter};
use crate::ingest::app_lookup::SteamAppIndex;
use crate::ingest::backoff::Backoff;
use crate::ingest::rate_limit::RateLimiter;
use crate::normalization::title::{edition_hint, slugify};

/// Default sync interval after a clean run.
const SYNC_INTERVAL_SECS: i64 = 6 * 3600;
/// Heartbeat the sync lease every this many records.
const HEARTBEAT_EVERY: u64 = 50;
/// Stream-level transport retries before a source run is declared failed.
const MAX_TRANSPORT_RETRIES: u32 = 3;

/// Cooperative cancellation shared between the CLI signal handler and the
/// worker pool. Observed between records; a committed record is never
/// rolled back.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct SourceRunReport {
    pub slug: String,
    pub status: &'static str,
    pub records: u64,
    pub prices_written: u64,
    pub media_rows: u64,
    pub skipped: u64,
    pub alerts_fired: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub sources_run: u32,
    pub sources_failed: u32,
    pub reports: Vec<SourceRunReport>,
}

impl RunSummary {
    /// 0 when everything succeeded, 4 when some sources failed.
    pub fn exit_code(&self) -> i32 {
        if self.sources_failed > 0 {
            4
        } else {
            0
        }
    }
}

#[derive(Debug, Default)]
struct RecordOutcome {
    wrote_price: bool,
    media_rows: u64,
    offer_jurisdiction_id: Option<i64>,
    /// Present when the caller asked for deferred (batched) price writes.
    deferred_price: Option<(PriceRow, CurrentPriceRow)>,
}

/// Map an anyhow error from the DB helpers onto the ingest taxonomy.
fn classify_record_error(err: anyhow::Error) -> IngestError {
    if let Some(db_err) = err.downcast_ref::<sqlx::Error>() {
        if is_unique_violation(db_err) {
            return IngestError::Conflict(err.to_string());
        }
        if is_check_violation(db_err) {
            return IngestError::InvariantViolation {
                entity: "record",
                id: 0,
                detail: err.to_string(),
            };
        }
        return IngestError::Fatal(err.to_string());
    }
    IngestError::Upstream(err.to_string())
}

/// Display name for a steam-style "app:<id>" external id, via the optional
/// local app index.
fn steam_title_fallback<'a>(index: &'a SteamAppIndex, external_id: &str) -> Option<&'a str> {
    let id = external_id.strip_prefix("app:")?.parse::<u64>().ok()?;
    index.name_for(id)
}

pub struct IngestPipeline {
    db: Db,
    config: Config,
    fx: ExchangeService,
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    limiters: StdMutex<HashMap<i64, Arc<RateLimiter>>>,
    steam_apps: SteamAppIndex,
    worker_id: String,
}

impl IngestPipeline {
    pub fn new(db: Db, config: Config) -> Self {
        let fx = ExchangeService::new(db.clone(), config.http_timeout);
        let steam_apps = match config.steam_apps_path.as_deref() {
            Some(path) => SteamAppIndex::load(Path::new(path)).unwrap_or_else(|e| {
                warn!(error = %e, "steam app index unreadable; continuing without it");
                SteamAppIndex::default()
            }),
            None => SteamAppIndex::default(),
        };
        Self {
            db,
            config,
            fx,
            adapters: HashMap::new(),
            limiters: StdMutex::new(HashMap::new()),
            steam_apps,
            worker_id: format!("ingest-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn register_adapter(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.id().slug, adapter);
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn limiter_for(&self, src: &DueSource) -> Arc<RateLimiter> {
        let mut map = self.limiters.lock().expect("limiter map poisoned");
        map.entry(src.binding_id)
            .or_insert_with(|| {
                Arc::new(RateLimiter::new(
                    src.rate_limit_per_minute.max(1) as u32,
                    src.rate_limit_burst.max(1) as u32,
                ))
            })
            .clone()
    }

    /// Run one source by provider slug (the `ingest --source` path).
    pub async fn ingest_one(
        &self,
        slug: &str,
        region: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<SourceRunReport, IngestError> {
        let src = sources::find_source_by_slug(&self.db, slug)
            .await
            .map_err(|e| IngestError::Fatal(e.to_string()))?
            .ok_or_else(|| IngestError::Config(format!("no enabled source with slug {slug}")))?;
        Ok(self.run_source(src, region, cancel).await)
    }

    /// Poll the registry and drain every due source, `ingest_workers` at a
    /// time. Between passes the maintenance duties run: stale-lock
    /// recovery and next-month partition pre-creation.
    pub async fn ingest_all(&self, cancel: &CancellationToken) -> Result<RunSummary, IngestError> {
        let mut summary = RunSummary::default();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let due = list_due_sources(&self.db, Utc::now(), self.config.ingest_workers as i64 * 4)
                .await
                .map_err(|e| IngestError::Fatal(e.to_string()))?;
            if due.is_empty() {
                break;
            }

            let reports: Vec<SourceRunReport> = futures::stream::iter(due)
                .map(|src| async move { self.run_source(src, None, cancel).await })
                .buffer_unordered(self.config.ingest_workers)
                .collect()
                .await;

            for report in reports {
                summary.sources_run += 1;
                if report.status == "error" {
                    summary.sources_failed += 1;
                }
                summary.reports.push(report);
            }

            if let Err(e) =
                recover_stale_provider_item_locks(&self.db, self.config.stale_lock_minutes).await
            {
                warn!(error = %e, "stale lock recovery failed");
            }
            if let Err(e) = precreate_future_partition(&self.db).await {
                warn!(error = %e, "partition pre-creation failed");
            }
        }
        Ok(summary)
    }

    /// Claim a batch of unprocessed provider items for one source, ask the
    /// adapter for their full records (cursor `items:<id,...>`), and
    /// finalize the batch. Prices collected along the way land through the
    /// batched write path.
    pub async fn enrich_items(
        &self,
        slug: &str,
        batch_size: i64,
        cancel: &CancellationToken,
    ) -> Result<SourceRunReport, IngestError> {
        let src = sources::find_source_by_slug(&self.db, slug)
            .await
            .map_err(|e| IngestError::Fatal(e.to_string()))?
            .ok_or_else(|| IngestError::Config(format!("no enabled source with slug {slug}")))?;
        let adapter = self
            .adapters
            .get(&src.slug)
            .cloned()
            .ok_or_else(|| IngestError::Config(format!("no adapter registered for {slug}")))?;

        let mut report = SourceRunReport {
            slug: src.slug.clone(),
            status: "ok",
            ..Default::default()
        };

        let claimed =
            claim_provider_items_batch(&self.db, &self.worker_id, batch_size, Some(src.provider_id))
                .await
                .map_err(|e| IngestError::Fatal(e.to_string()))?;
        if claimed.is_empty() {
            return Ok(report);
        }

        let cursor = format!(
            "items:{}",
            claimed
                .iter()
                .map(|c| c.external_id.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
        let limiter = self.limiter_for(&src);
        let mut price_rows: Vec<PriceRow> = Vec::new();
        let mut current_rows: Vec<CurrentPriceRow> = Vec::new();

        match adapter.fetch(Some(cursor), None).await {
            Ok(mut stream) => {
                while let Some(next) = stream.next().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    limiter.acquire().await;
                    let rec = match next {
                        Ok(rec) => rec,
                        Err(IngestError::Upstream(msg)) => {
                            report.skipped += 1;
                            report.errors.push(format!("upstream: {msg}"));
                            continue;
                        }
                        Err(e) => {
                            report.status = "error";
                            report.errors.push(e.to_string());
                            break;
                        }
                    };
                    report.records += 1;
                    match self.process_record(&src, &rec, true).await {
                        Ok(outcome) => {
                            report.media_rows += outcome.media_rows;
                            if let Some((price, current)) = outcome.deferred_price {
                                price_rows.push(price);
                                current_rows.push(current);
                            }
                        }
                        Err(IngestError::Upstream(msg)) => {
                            report.skipped += 1;
                            report.errors.push(format!("upstream: {msg}"));
                        }
                        Err(e) => {
                            report.errors.push(e.to_string());
                        }
                    }
                }
            }
            Err(e) => {
                report.status = "error";
                report.errors.push(e.to_string());
            }
        }

        report.prices_written = price_rows.len() as u64;
        if !price_rows.is_empty() {
            self.db
                .bulk_insert_prices(&price_rows)
                .await
                .map_err(|e| IngestError::Fatal(e.to_string()))?;
            self.db
                .upsert_current_prices(&current_rows)
                .await
                .map_err(|e| IngestError::Fatal(e.to_string()))?;
        }

        let ids: Vec<i64> = claimed.iter().map(|c| c.id).collect();
        finalize_provider_items(&self.db, &ids, &json!({}))
            .await
            .map_err(|e| IngestError::Fatal(e.to_string()))?;

        if report.status == "ok" && !report.errors.is_empty() {
            report.status = "partial";
        }
        info!(
            slug = %report.slug,
            claimed = ids.len(),
            records = report.records,
            prices = report.prices_written,
            "enrichment batch finished"
        );
        Ok(report)
    }

    /// One full sync run for one source: lease, fetch, canonicalize,
    /// bookkeeping. Never panics the pool; all failure shapes land in the
    /// report and the sync-state row.
    #[instrument(skip(self, src, cancel), fields(slug = %src.slug))]
    async fn run_source(
        &self,
        src: DueSource,
        region_override: Option<String>,
        cancel: &CancellationToken,
    ) -> SourceRunReport {
        let mut report = SourceRunReport {
            slug: src.slug.clone(),
            status: "ok",
            ..Default::default()
        };

        let lease = match claim_source_for_sync(&self.db, src.binding_id, &self.worker_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                report.status = "pending";
                report.errors.push("sync lease held elsewhere".into());
                return report;
            }
            Err(e) => {
                report.status = "error";
                report.errors.push(format!("lease claim failed: {e}"));
                return report;
            }
        };

        let Some(adapter) = self.adapters.get(&src.slug).cloned() else {
            report.status = "error";
            report.errors.push(format!("no adapter registered for {}", src.slug));
            let _ = finish_sync(
                &self.db,
                src.binding_id,
                lease,
                &SyncOutcome {
                    status: "error",
                    cursor: None,
                    error: Some(report.errors.last().cloned().unwrap_or_default()),
                    next_interval_secs: SYNC_INTERVAL_SECS,
                },
            )
            .await;
            return report;
        };

        let limiter = self.limiter_for(&src);
        let regions: Vec<Option<String>> = match region_override {
            Some(r) => vec![Some(r)],
            None if src.jurisdiction_scope.is_empty() => vec![None],
            None => src.jurisdiction_scope.iter().cloned().map(Some).collect(),
        };

        let mut backoff = Backoff::new();
        let mut lease_lost = false;
        let mut touched_ojs: Vec<i64> = Vec::new();

        'regions: for region in regions {
            if cancel.is_cancelled() {
                break;
            }
            let mut stream = loop {
                match adapter.fetch(src.sync_cursor.clone(), region.clone()).await {
                    Ok(s) => break s,
                    Err(IngestError::Transport(msg))
                        if backoff.attempt() < MAX_TRANSPORT_RETRIES =>
                    {
                        warn!(slug = %src.slug, error = %msg, "transport error; backing off");
                        report.errors.push(format!("transport: {msg}"));
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                    Err(e) => {
                        report.status = "error";
                        report.errors.push(e.to_string());
                        break 'regions;
                    }
                }
            };
            backoff.reset();

            while let Some(next) = stream.next().await {
                if cancel.is_cancelled() {
                    break 'regions;
                }
                let rec = match next {
                    Ok(rec) => rec,
                    Err(IngestError::Upstream(msg)) => {
                        report.skipped += 1;
                        report.errors.push(format!("upstream: {msg}"));
                        continue;
                    }
                    Err(e) => {
                        report.status = "error";
                        report.errors.push(e.to_string());
                        break 'regions;
                    }
                };

                limiter.acquire().await;

                report.records += 1;
                if report.records % HEARTBEAT_EVERY == 0 {
                    match heartbeat_sync_lease(&self.db, src.binding_id, lease).await {
                        Ok(true) => {}
                        Ok(false) => {
                            report.status = "error";
                            report.errors.push("sync lease lost".into());
                            lease_lost = true;
                            break 'regions;
                        }
                        Err(e) => {
                            warn!(error = %e, "lease heartbeat failed");
                        }
                    }
                }

                match self.process_record_with_retry(&src, &rec).await {
                    Ok(outcome) => {
                        if outcome.wrote_price {
                            report.prices_written += 1;
                        }
                        report.media_rows += outcome.media_rows;
                        if let Some(oj) = outcome.offer_jurisdiction_id {
                            touched_ojs.push(oj);
                            if let Err(e) =
                                self.db.refresh_video_game_regional_prices(&[oj]).await
                            {
                                warn!(error = %e, "regional price refresh failed");
                            }
                        }
                    }
                    Err(IngestError::Upstream(msg)) => {
                        report.skipped += 1;
                        report.errors.push(format!("upstream: {msg}"));
                    }
                    Err(e @ IngestError::Conflict(_))
                    | Err(e @ IngestError::InvariantViolation { .. }) => {
                        report.errors.push(e.to_string());
                    }
                    Err(IngestError::Lock(msg)) => {
                        report.status = "error";
                        report.errors.push(format!("lock: {msg}"));
                        lease_lost = true;
                        break 'regions;
                    }
                    Err(e) => {
                        report.status = "error";
                        report.errors.push(e.to_string());
                        break 'regions;
                    }
                }
            }
        }

        if report.status == "ok" && !report.errors.is_empty() {
            report.status = "partial";
        }

        if !touched_ojs.is_empty() {
            touched_ojs.sort_unstable();
            touched_ojs.dedup();
            match evaluate_alerts(&self.db, &self.fx, &touched_ojs).await {
                Ok(triggers) => {
                    report.alerts_fired = triggers.len() as u64;
                    for t in &triggers {
                        info!(
                            alert_id = t.alert_id,
                            user_id = t.user_id,
                            channel = %t.channel,
                            current_sats = t.current_sats,
                            "alert fired"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "alert evaluation failed"),
            }
        }

        let outcome = SyncOutcome {
            status: report.status,
            cursor: None,
            error: report.errors.last().cloned(),
            next_interval_secs: if report.status == "error" {
                backoff.next_delay().as_secs() as i64
            } else {
                SYNC_INTERVAL_SECS
            },
        };
        if !lease_lost {
            if let Err(e) = finish_sync(&self.db, src.binding_id, lease, &outcome).await {
                warn!(error = %e, "finish_sync failed");
            }
        }
        if let Err(e) = record_sync_state(
            &self.db,
            src.provider_id,
            "full",
            Some(src.binding_id),
            report.status,
            &json!({
                "records": report.records,
                "prices": report.prices_written,
                "media": report.media_rows,
                "skipped": report.skipped,
            }),
            report.errors.clone(),
        )
        .await
        {
            warn!(error = %e, "sync state bookkeeping failed");
        }

        info!(
            slug = %report.slug,
            status = report.status,
            records = report.records,
            prices = report.prices_written,
            "source run finished"
        );
        report
    }

    /// Process one record; `Conflict` (a lost idempotent-upsert race) is
    /// retried once, a second failure surfaces as a logic bug.
    async fn process_record_with_retry(
        &self,
        src: &DueSource,
        rec: &RawRecord,
    ) -> Result<RecordOutcome, IngestError> {
        match self.process_record(src, rec, false).await {
            Err(IngestError::Conflict(_)) => self.process_record(src, rec, false).await,
            other => other,
        }
    }

    /// Canonicalize one record inside one transaction: provider item,
    /// catalog entities, offer/price chain, media. All-or-nothing. With
    /// `defer_prices` the price sample is returned instead of written, for
    /// the batched enrichment path.
    async fn process_record(
        &self,
        src: &DueSource,
        rec: &RawRecord,
        defer_prices: bool,
    ) -> Result<RecordOutcome, IngestError> {
        // Partition DDL and FX reads stay outside the record transaction.
        if !defer_prices && rec.kind == RecordKind::Price && rec.amount_minor.is_some() {
            ensure_price_partition(&self.db, rec.recorded_at)
                .await
                .map_err(|e| IngestError::Fatal(e.to_string()))?;
        }
        let currency_code = rec
            .currency
            .as_deref()
            .map(|c| c.trim().to_ascii_uppercase());
        let btc_rate = match currency_code.as_deref() {
            Some(cur) if cur != "BTC" => self
                .fx
                .latest_rate(cur, "BTC")
                .await
                .map_err(|e| IngestError::Fatal(e.to_string()))?,
            Some(_) => Some(1.0),
            None => None,
        };

        let mut tx = self
            .db
            .pool
            .begin()
            .await
            .map_err(|e| IngestError::Fatal(e.to_string()))?;
        let outcome = self
            .process_record_tx(&mut tx, src, rec, btc_rate, defer_prices)
            .await
            .map_err(classify_record_error)?;
        tx.commit()
            .await
            .map_err(|e| IngestError::Fatal(e.to_string()))?;
        Ok(outcome)
    }

    async fn process_record_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        src: &DueSource,
        rec: &RawRecord,
        btc_rate: Option<f64>,
        defer_prices: bool,
    ) -> Result<RecordOutcome> {
        let conn: &mut PgConnection = &mut *tx;
        let mut outcome = RecordOutcome::default();

        let attributes = if rec.attributes.is_null() {
            None
        } else {
            Some(&rec.attributes)
        };

        // Catalog discoveries with no payload stay claimable for the
        // enrichment pass; everything else is stamped as seen.
        let provider_item_id = if rec.kind == RecordKind::Catalog && attributes.is_none() {
            seed_provider_item(conn, src.provider_id, &rec.external_id).await?
        } else {
            ensure_provider_item(conn, src.provider_id, &rec.external_id, attributes).await?
        };

        // Catalog entities are created lazily whenever a record names a title.
        let mut game_id: Option<i64> = None;
        let mut title_id: Option<i64> = None;
        let title_hint = rec
            .title_hint
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| steam_title_fallback(&self.steam_apps, &rec.external_id));
        if let Some(title) = title_hint {
            let product_name = rec.product_hint.as_deref().unwrap_or(title);
            let slug = slugify(product_name);
            let product_id = ensure_product(conn, &slug, product_name, "software").await?;
            let tid = ensure_title(conn, product_id, title).await?;
            ensure_title_source(conn, tid, src.provider_id, Some(&rec.external_id)).await?;

            let platform = rec.platform_hint.as_deref().unwrap_or("pc");
            let platform_id = ensure_platform(conn, platform, platform).await?;
            let edition = edition_hint(title, Some(&rec.attributes)).label;
            let gid = ensure_video_game(conn, tid, platform_id, edition.as_deref()).await?;
            title_id = Some(tid);
            game_id = Some(gid);
        }

        // Offer/price chain.
        if let (RecordKind::Price, Some(amount), Some(tid)) =
            (rec.kind, rec.amount_minor, title_id)
        {
            let (country_hint, sub_region) = rec.region_parts();
            let country = country_hint.unwrap_or("US");
            let currency = match currency_code_for_record(rec, country) {
                Some(c) => c,
                None => anyhow::bail!("price record {} carries no currency", rec.external_id),
            };
            let minor_unit = currency_minor_unit(&currency);
            let currency_id =
                ensure_currency(conn, &currency, &currency_display_name(&currency), minor_unit)
                    .await?;
            let country_id = ensure_country(conn, country, country, currency_id).await?;
            let jurisdiction_id = ensure_jurisdiction(conn, country_id, sub_region).await?;

            let sellable_id = ensure_sellable_software(conn, tid).await?;
            let offer_id =
                ensure_offer(conn, sellable_id, src.retailer_id, rec.sku.as_deref()).await?;
            let oj_id =
                ensure_offer_jurisdiction(conn, offer_id, jurisdiction_id, currency_id).await?;

            let sats = if currency == "BTC" {
                Some(amount)
            } else {
                btc_sats_for_amount(amount, minor_unit, btc_rate)
            };

            let price = PriceRow {
                offer_jurisdiction_id: oj_id,
                provider_item_id: Some(provider_item_id),
                recorded_at: rec.recorded_at,
                amount_minor: amount,
                tax_inclusive: rec.tax_inclusive,
                fx_minor_per_unit: None,
                btc_sats_per_unit: sats,
                meta: rec.attributes.clone(),
            };
            let current = CurrentPriceRow {
                offer_jurisdiction_id: oj_id,
                amount_minor: amount,
                recorded_at: rec.recorded_at,
                agent: src.provider_key.clone(),
                agent_priority: src.agent_priority,
            };

            if defer_prices {
                outcome.deferred_price = Some((price, current));
            } else {
                sqlx::query(
                    "INSERT INTO prices (offer_jurisdiction_id, provider_item_id, recorded_at,
                                         amount_minor, tax_inclusive, btc_sats_per_unit, meta)
                     VALUES ($1,$2,$3,$4,$5,$6,$7)",
                )
                .persistent(false)
                .bind(price.offer_jurisdiction_id)
                .bind(price.provider_item_id)
                .bind(price.recorded_at)
                .bind(price.amount_minor)
                .bind(price.tax_inclusive)
                .bind(price.btc_sats_per_unit)
                .bind(&price.meta)
                .execute(&mut *conn)
                .await?;
                upsert_current_price_tx(conn, &current).await?;
                outcome.wrote_price = true;
                outcome.offer_jurisdiction_id = Some(oj_id);
            }
        }

        // Media: always linked per-source; attached to the game when known.
        for m in &rec.media {
            if m.url.trim().is_empty() {
                continue;
            }
            ensure_vg_source_media_link(
                conn,
                src.provider_id,
                &m.url,
                Some(&m.media_type),
                None,
                &m.provider_data,
            )
            .await?;
            if let Some(gid) = game_id {
                upsert_game_media(
                    conn,
                    &GameMediaUpsert {
                        video_game_id: gid,
                        source: &src.provider_key,
                        external_id: &format!("{}:{}", rec.external_id, m.url),
                        media_type: &m.media_type,
                        url: &m.url,
                        stream_url: m.stream_url.as_deref(),
                        width: m.width,
                        height: m.height,
                        mime_type: m.mime_type.as_deref(),
                        provider_data: m.provider_data.clone(),
                    },
                )
                .await?;
            }
            outcome.media_rows += 1;
        }

        Ok(outcome)
    }
}

/// Currency stated on the record, else the country's default.
fn currency_code_for_record(rec: &RawRecord, country: &str) -> Option<String> {
    if let Some(c) = rec.currency.as_deref() {
        let c = c.trim().to_ascii_uppercase();
        if !c.is_empty() {
            return Some(c);
        }
    }
    Some(currency_for_country(country).0.to_string())
}

fn currency_display_name(code: &str) -> String {
    // Known names come from the country table; anything else keeps its code.
    for iso2 in ["US", "GB", "DE", "JP", "CA", "AU", "CH", "CN", "KR", "BR", "MX", "PL"] {
        let (c, name) = currency_for_country(iso2);
        if c == code {
            return name.to_string();
        }
    }
    code.to_string()
}

/// Single-row current-price upsert under the replacement rule, transaction
/// scoped. Mirrors the batch path on [`Db::upsert_current_prices`].
async fn upsert_current_price_tx(conn: &mut PgConnection, row: &CurrentPriceRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO current_price (offer_jurisdiction_id, amount_minor, recorded_at, agent, agent_priority)
         VALUES ($1,$2,$3,$4,$5)
         ON CONFLICT (offer_jurisdiction_id)
         DO UPDATE SET amount_minor = EXCLUDED.amount_minor,
                       recorded_at = EXCLUDED.recorded_at,
                       agent = EXCLUDED.agent,
                       agent_priority = EXCLUDED.agent_priority
         WHERE (EXCLUDED.recorded_at > current_price.recorded_at + interval '1 second')
            OR (EXCLUDED.recorded_at >= current_price.recorded_at
                AND EXCLUDED.agent_priority > current_price.agent_priority)
            OR (EXCLUDED.recorded_at = current_price.recorded_at
                AND EXCLUDED.agent_priority = current_price.agent_priority
                AND EXCLUDED.agent < current_price.agent)",
    )
    .persistent(false)
    .bind(row.offer_jurisdiction_id)
    .bind(row.amount_minor)
    .bind(row.recorded_at)
    .bind(&row.agent)
    .bind(row.agent_priority)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn price_record(currency: Option<&str>, region: Option<&str>) -> RawRecord {
        serde_json::from_value(json!({
            "external_id": "app:620",
            "kind": "price",
            "title_hint": "Portal 2",
            "platform_hint": "pc",
            "currency": currency,
            "region": region,
            "amount_minor": 999,
            "recorded_at": "2026-01-15T10:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn record_currency_wins_over_country_default() {
        let rec = price_record(Some("eur"), Some("US"));
        assert_eq!(currency_code_for_record(&rec, "US").as_deref(), Some("EUR"));
    }

    #[test]
    fn country_default_fills_missing_currency() {
        let rec = price_record(None, Some("JP"));
        assert_eq!(currency_code_for_record(&rec, "JP").as_deref(), Some("JPY"));
    }

    #[test]
    fn cancellation_token_flips_once() {
        let t = CancellationToken::new();
        assert!(!t.is_cancelled());
        let t2 = t.clone();
        t2.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn run_summary_exit_codes() {
        let mut s = RunSummary::default();
        assert_eq!(s.exit_code(), 0);
        s.sources_failed = 1;
        assert_eq!(s.exit_code(), 4);
    }

    #[test]
    fn classify_maps_non_db_errors_to_upstream() {
        let e = classify_record_error(anyhow::anyhow!("bad payload"));
        assert!(matches!(e, IngestError::Upstream(_)));
    }

    #[test]
    fn known_currency_names_resolve() {
        assert_eq!(currency_display_name("USD"), "United States Dollar");
        assert_eq!(currency_display_name("XYZ"), "XYZ");
    }

    #[test]
    fn steam_fallback_only_matches_app_ids() {
        let idx = SteamAppIndex::default();
        assert_eq!(steam_title_fallback(&idx, "app:620"), None);
        assert_eq!(steam_title_fallback(&idx, "sku-123"), None);
    }

    #[test]
    fn plain_titles_create_base_edition_games() {
        let rec = price_record(None, None);
        let hint = edition_hint(rec.title_hint.as_deref().unwrap(), None);
        assert!(!hint.has_edition);
        assert_eq!(
            rec.recorded_at,
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
        );
    }
}
