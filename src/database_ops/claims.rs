//! Claim/finalize protocol for provider items plus the partition index job
//! queue. The claim batch is the only place row locks are taken; everything
//! downstream is an idempotent upsert so a lost worker costs one lease
//! timeout, never compensation logic.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::Value;
use sqlx::Row;
use tracing::{info, instrument, warn};

use crate::database_ops::db::Db;
use crate::database_ops::prices::recent_cutoff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedItem {
    pub id: i64,
    pub provider_id: i64,
    pub external_id: String,
}

/// Atomically claim up to `batch_size` unprocessed provider items, skipping
/// rows other workers hold. Optional `provider_id` scopes the sweep.
#[instrument(skip(db))]
pub async fn claim_provider_items_batch(
    db: &Db,
    worker_id: &str,
    batch_size: i64,
    provider_id: Option<i64>,
) -> Result<Vec<ClaimedItem>> {
    let rows = sqlx::query(
        "WITH picked AS (
            SELECT id FROM provider_items
            WHERE (attributes IS NULL OR last_seen_at IS NULL)
              AND locked_by IS NULL
              AND ($3::bigint IS NULL OR provider_id = $3)
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            LIMIT $2
         )
         UPDATE provider_items pi
         SET locked_by = $1, locked_at = now()
         FROM picked
         WHERE pi.id = picked.id
         RETURNING pi.id, pi.provider_id, pi.external_id",
    )
    .persistent(false)
    .bind(worker_id)
    .bind(batch_size)
    .bind(provider_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| ClaimedItem {
            id: r.get("id"),
            provider_id: r.get("provider_id"),
            external_id: r.get("external_id"),
        })
        .collect())
}

/// Release claimed items: merge attributes, stamp last_seen_at, clear locks.
#[instrument(skip(db, attributes))]
pub async fn finalize_provider_items(db: &Db, ids: &[i64], attributes: &Value) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let res = sqlx::query(
        "UPDATE provider_items
         SET attributes = COALESCE(attributes, '{}'::jsonb) || $2,
             last_seen_at = now(),
             locked_by = NULL,
             locked_at = NULL
         WHERE id = ANY($1)",
    )
    .persistent(false)
    .bind(ids)
    .bind(attributes)
    .execute(&db.pool)
    .await?;
    Ok(res.rows_affected())
}

/// Clear locks older than the threshold so crashed workers' claims return to
/// the pool. Run on a timer.
#[instrument(skip(db))]
pub async fn recover_stale_provider_item_locks(db: &Db, threshold_minutes: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE provider_items
         SET locked_by = NULL, locked_at = NULL
         WHERE locked_by IS NOT NULL
           AND locked_at < now() - make_interval(mins => $1::int)",
    )
    .persistent(false)
    .bind(threshold_minutes)
    .execute(&db.pool)
    .await?;
    if res.rows_affected() > 0 {
        info!(recovered = res.rows_affected(), "recovered stale provider item locks");
    }
    Ok(res.rows_affected())
}

#[derive(Debug, sqlx::FromRow)]
struct IndexJob {
    id: i64,
    partition_name: String,
    index_type: String,
}

/// CREATE INDEX CONCURRENTLY statement for one job. Partition and index
/// names come from our own partition helper, never user input.
fn build_index_sql(job: &IndexJob, today: NaiveDate) -> Option<String> {
    let index_name = format!("{}_{}_idx", job.partition_name, job.index_type).to_lowercase();
    match job.index_type.as_str() {
        "brin_recorded" => Some(format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {index_name} ON {} USING brin(recorded_at) WITH (pages_per_range = 128)",
            job.partition_name
        )),
        "recent_7d" => Some(format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {index_name} ON {} (offer_jurisdiction_id, recorded_at DESC) WHERE recorded_at >= '{}'",
            job.partition_name,
            recent_cutoff(today, 7)
        )),
        "recent_30d" => Some(format!(
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS {index_name} ON {} (offer_jurisdiction_id, recorded_at DESC) WHERE recorded_at >= '{}'",
            job.partition_name,
            recent_cutoff(today, 30)
        )),
        _ => None,
    }
}

/// Drain up to `max` pending partition index jobs. Failures are recorded and
/// retried after a cooldown; the job row carries the attempt count and last
/// error message.
#[instrument(skip(db))]
pub async fn process_partition_index_jobs(db: &Db, max: i64) -> Result<u64> {
    let mut processed = 0u64;
    for _ in 0..max {
        let Some(job) = sqlx::query_as::<_, IndexJob>(
            "SELECT id, partition_name, index_type
             FROM partition_index_jobs
             WHERE status IN ('pending', 'failed')
               AND (last_attempt_at IS NULL OR last_attempt_at < now() - interval '5 minutes')
             ORDER BY created_at
             LIMIT 1",
        )
        .persistent(false)
        .fetch_optional(&db.pool)
        .await?
        else {
            break;
        };

        sqlx::query(
            "UPDATE partition_index_jobs
             SET status = 'running', attempts = attempts + 1, last_attempt_at = now()
             WHERE id = $1",
        )
        .persistent(false)
        .bind(job.id)
        .execute(&db.pool)
        .await?;

        let Some(sql) = build_index_sql(&job, chrono::Utc::now().date_naive()) else {
            sqlx::query(
                "UPDATE partition_index_jobs
                 SET status = 'failed', error_message = 'unknown index type'
                 WHERE id = $1",
            )
            .persistent(false)
            .bind(job.id)
            .execute(&db.pool)
            .await?;
            continue;
        };

        // Dynamic DDL must run as a raw statement outside any transaction.
        match sqlx::raw_sql(&sql).execute(&db.pool).await {
            Ok(_) => {
                sqlx::query(
                    "UPDATE partition_index_jobs
                     SET status = 'completed', error_message = NULL
                     WHERE id = $1",
                )
                .persistent(false)
                .bind(job.id)
                .execute(&db.pool)
                .await?;
                processed += 1;
            }
            Err(e) => {
                warn!(job = job.id, partition = %job.partition_name, error = %e, "index job failed");
                sqlx::query(
                    "UPDATE partition_index_jobs
                     SET status = 'failed', error_message = $2
                     WHERE id = $1",
                )
                .persistent(false)
                .bind(job.id)
                .bind(e.to_string())
                .execute(&db.pool)
                .await
                .context("recording index job failure")?;
            }
        }
    }
    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(index_type: &str) -> IndexJob {
        IndexJob {
            id: 1,
            partition_name: "prices_2026_01".into(),
            index_type: index_type.into(),
        }
    }

    #[test]
    fn brin_sql_targets_partition() {
        let sql = build_index_sql(&job("brin_recorded"), NaiveDate::from_ymd_opt(2026, 1, 20).unwrap())
            .unwrap();
        assert!(sql.contains("prices_2026_01_brin_recorded_idx"));
        assert!(sql.contains("USING brin(recorded_at)"));
        assert!(sql.contains("CONCURRENTLY"));
    }

    #[test]
    fn recency_sql_embeds_literal_cutoff() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 20).unwrap();
        let sql = build_index_sql(&job("recent_7d"), today).unwrap();
        assert!(sql.contains(&format!("recorded_at >= '{}'", recent_cutoff(today, 7))));
    }

    #[test]
    fn unknown_index_type_is_rejected() {
        assert!(build_index_sql(&job("nope"), NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()).is_none());
    }
}
