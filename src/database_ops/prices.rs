//! Price-store maintenance and read paths: partition helpers, retention,
//! bucketed series, materialized-view refresh. The hot write path lives on
//! [`crate::database_ops::db::Db`].

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use sqlx::Row;
use tracing::{info, instrument};

use crate::database_ops::db::Db;

/// Child partition name for a timestamp: `prices_YYYY_MM`.
pub fn partition_name_for(ts: DateTime<Utc>) -> String {
    format!("prices_{:04}_{:02}", ts.year(), ts.month())
}

/// Cutoff date for the recency partial indexes. The cutoff is a literal in
/// the index predicate, anchored at the 10th of the month and rolled forward
/// in whole weeks so the predicate only changes once a week.
pub fn recent_cutoff(today: NaiveDate, window_days: i64) -> NaiveDate {
    let mut anchor = NaiveDate::from_ymd_opt(today.year(), today.month(), 10)
        .unwrap_or(today);
    if anchor > today {
        let prev = if today.month() == 1 {
            NaiveDate::from_ymd_opt(today.year() - 1, 12, 10)
        } else {
            NaiveDate::from_ymd_opt(today.year(), today.month() - 1, 10)
        };
        anchor = prev.unwrap_or(today);
    }
    let weeks = (today - anchor).num_days() / 7;
    anchor + Duration::days(weeks * 7) - Duration::days(window_days)
}

/// Create the monthly partition covering `ts` (no-op when it exists).
pub async fn ensure_price_partition(db: &Db, ts: DateTime<Utc>) -> Result<String> {
    let name = sqlx::query_scalar::<_, String>("SELECT ensure_price_partition($1)")
        .persistent(false)
        .bind(ts)
        .fetch_one(&db.pool)
        .await?;
    Ok(name)
}

/// Pre-create next month's partition so month rollover never races ingest.
pub async fn precreate_future_partition(db: &Db) -> Result<String> {
    ensure_price_partition(db, Utc::now() + Duration::days(30)).await
}

/// Partitions that would be detached by `archive_old_price_partitions`.
pub async fn list_archivable_partitions(db: &Db, months_to_keep: i32) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT c.relname AS name
         FROM pg_inherits i
         JOIN pg_class c ON c.oid = i.inhrelid
         JOIN pg_class p ON p.oid = i.inhparent
         WHERE p.relname = 'prices'
           AND c.relname ~ '^prices_\\d{4}_\\d{2}$'
           AND to_date(substring(c.relname FROM 8), 'YYYY_MM') + interval '1 month'
               <= date_trunc('month', now()) - make_interval(months => $1)
         ORDER BY c.relname",
    )
    .persistent(false)
    .bind(months_to_keep)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.get("name")).collect())
}

/// Detach partitions older than `months_to_keep`. Dry-run lists only.
#[instrument(skip(db))]
pub async fn archive_old_price_partitions(
    db: &Db,
    months_to_keep: i32,
    apply: bool,
) -> Result<Vec<String>> {
    if !apply {
        let names = list_archivable_partitions(db, months_to_keep).await?;
        info!(candidates = names.len(), "archive dry-run; pass --apply to detach");
        return Ok(names);
    }
    let names: Vec<String> =
        sqlx::query_scalar("SELECT archive_old_price_partitions($1)")
            .persistent(false)
            .bind(months_to_keep)
            .fetch_all(&db.pool)
            .await?;
    info!(detached = names.len(), "detached price partitions");
    Ok(names)
}

pub async fn refresh_materialized_views(db: &Db) -> Result<()> {
    // First refresh after creation cannot be concurrent (view is WITH NO DATA).
    let populated: bool = sqlx::query_scalar(
        "SELECT ispopulated FROM pg_matviews WHERE matviewname = 'mv_price_daily'",
    )
    .persistent(false)
    .fetch_optional(&db.pool)
    .await?
    .unwrap_or(false);
    let stmt = if populated {
        "REFRESH MATERIALIZED VIEW CONCURRENTLY mv_price_daily"
    } else {
        "REFRESH MATERIALIZED VIEW mv_price_daily"
    };
    sqlx::raw_sql(stmt).execute(&db.pool).await?;
    info!("refreshed mv_price_daily");
    Ok(())
}

#[derive(Debug, sqlx::FromRow)]
pub struct BucketedPrice {
    pub offer_jurisdiction_id: i64,
    pub provider_item_id: Option<i64>,
    pub bucket: DateTime<Utc>,
    pub amount_minor: i64,
    pub is_free: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Latest sample per provider per day bucket for one offer jurisdiction.
pub async fn daily_last_by_source(
    db: &Db,
    offer_jurisdiction_id: i64,
    since: DateTime<Utc>,
) -> Result<Vec<BucketedPrice>> {
    let rows = sqlx::query_as::<_, BucketedPrice>(
        "SELECT offer_jurisdiction_id, provider_item_id, bucket, amount_minor, is_free, recorded_at
         FROM prices_daily_last_by_source
         WHERE offer_jurisdiction_id = $1 AND bucket >= $2
         ORDER BY bucket",
    )
    .persistent(false)
    .bind(offer_jurisdiction_id)
    .bind(since)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn partition_names_are_zero_padded() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        assert_eq!(partition_name_for(ts), "prices_2026_01");
        let ts = Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap();
        assert_eq!(partition_name_for(ts), "prices_2025_11");
    }

    #[test]
    fn recent_cutoff_anchors_on_the_tenth() {
        // On the anchor day itself the 7-day window ends at anchor - 7.
        let d = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        assert_eq!(recent_cutoff(d, 7), NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
    }

    #[test]
    fn recent_cutoff_rolls_in_whole_weeks() {
        let base = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        // Days 10..16 share a cutoff; day 17 rolls one week forward.
        for offset in 0..7 {
            assert_eq!(
                recent_cutoff(base + Duration::days(offset), 7),
                NaiveDate::from_ymd_opt(2026, 3, 3).unwrap()
            );
        }
        assert_eq!(
            recent_cutoff(base + Duration::days(7), 7),
            NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
        );
    }

    #[test]
    fn recent_cutoff_before_the_tenth_uses_previous_month() {
        let d = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        // anchor = Feb 10; 22 days elapsed = 3 whole weeks -> Mar 3; minus 30.
        assert_eq!(recent_cutoff(d, 30), NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
    }

    #[test]
    fn recent_cutoff_january_falls_back_to_december() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        // anchor = Dec 10; 26 days elapsed = 3 whole weeks -> Dec 31; minus 7.
        let cut = recent_cutoff(d, 7);
        assert_eq!(cut, NaiveDate::from_ymd_opt(2025, 12, 24).unwrap());
    }
}
