use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, QueryBuilder,
};
use std::str::FromStr;
use tracing::{info, instrument};

/// One-second grace window for current-price replacement: a strictly newer
/// sample only displaces the projection when it is newer by more than this.
pub const CURRENT_PRICE_GRACE_SECS: i64 = 1;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // Unnamed statements only: safe under PgBouncer transaction pooling.
        connect_options = connect_options.statement_cache_capacity(0);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .idle_timeout(std::time::Duration::from_secs(600))
            .connect_with(connect_options)
            .await?;
        info!("connected to db");
        Ok(Self { pool })
    }

    /// Apply pending migrations. Version + checksum land in `_sqlx_migrations`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("migrations up-to-date");
        Ok(())
    }
}

/// One canonicalized price sample, ready for the history append.
#[derive(Debug, Clone)]
pub struct PriceRow {
    pub offer_jurisdiction_id: i64,
    pub provider_item_id: Option<i64>,
    pub recorded_at: DateTime<Utc>,
    pub amount_minor: i64,
    pub tax_inclusive: bool,
    pub fx_minor_per_unit: Option<i64>,
    pub btc_sats_per_unit: Option<i64>,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CurrentPriceRow {
    pub offer_jurisdiction_id: i64,
    pub amount_minor: i64,
    pub recorded_at: DateTime<Utc>,
    // Source agent (e.g. 'steam', 'isthereanydeal'). Tie-breaker on equal timestamps.
    pub agent: String,
    // Higher priority wins inside the grace window (storefront > aggregator > fallback).
    pub agent_priority: i16,
}

/// The current-price replacement rule. Must stay in lockstep with the SQL
/// `ON CONFLICT ... WHERE` clause in [`Db::upsert_current_prices`]:
/// 1. newer by more than the grace window, else
/// 2. not older, with strictly higher agent priority, else
/// 3. identical timestamp and priority, lexicographically smaller agent.
pub fn replaces_current(new: &CurrentPriceRow, cur: &CurrentPriceRow) -> bool {
    if new.recorded_at > cur.recorded_at + Duration::seconds(CURRENT_PRICE_GRACE_SECS) {
        return true;
    }
    if new.recorded_at >= cur.recorded_at && new.agent_priority > cur.agent_priority {
        return true;
    }
    new.recorded_at == cur.recorded_at
        && new.agent_priority == cur.agent_priority
        && new.agent < cur.agent
}

impl Db {
    /// Append price samples to the partitioned history. Partitions for every
    /// distinct month are ensured first so the batch insert never trips over
    /// missing DDL.
    #[instrument(skip(self, rows))]
    pub async fn bulk_insert_prices(&self, rows: &[PriceRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut months: std::collections::HashSet<(i32, u32)> = std::collections::HashSet::new();
        for r in rows {
            months.insert((r.recorded_at.year(), r.recorded_at.month()));
        }
        for (y, m) in months {
            if let Some(first) = Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single() {
                sqlx::query_scalar::<_, String>("SELECT ensure_price_partition($1)")
                    .persistent(false)
                    .bind(first)
                    .fetch_one(&self.pool)
                    .await?;
            }
        }

        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO prices (offer_jurisdiction_id, provider_item_id, recorded_at, amount_minor, tax_inclusive, fx_minor_per_unit, btc_sats_per_unit, meta) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.offer_jurisdiction_id)
                .push_bind(r.provider_item_id)
                .push_bind(r.recorded_at)
                .push_bind(r.amount_minor)
                .push_bind(r.tax_inclusive)
                .push_bind(r.fx_minor_per_unit)
                .push_bind(r.btc_sats_per_unit)
                .push_bind(&r.meta);
        });
        qb.build().persistent(false).execute(&self.pool).await?;
        info!(rows = rows.len(), "inserted price history rows");
        Ok(())
    }

    /// Upsert the current-price projection under the replacement rule, then
    /// refresh the denormalized regional price blobs for impacted games.
    #[instrument(skip(self, rows))]
    pub async fn upsert_current_prices(&self, rows: &[CurrentPriceRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        // Collapse the batch to one winner per offer_jurisdiction_id using
        // the same rule the SQL applies against the stored row.
        use std::collections::HashMap;
        let mut winners: HashMap<i64, &CurrentPriceRow> = HashMap::new();
        for r in rows {
            winners
                .entry(r.offer_jurisdiction_id)
                .and_modify(|cur| {
                    if replaces_current(r, cur) {
                        *cur = r;
                    }
                })
                .or_insert(r);
        }
        let uniques: Vec<&CurrentPriceRow> = winners.into_values().collect();

        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO current_price (offer_jurisdiction_id, amount_minor, recorded_at, agent, agent_priority) ",
        );
        qb.push_values(&uniques, |mut b, r| {
            b.push_bind(r.offer_jurisdiction_id)
                .push_bind(r.amount_minor)
                .push_bind(r.recorded_at)
                .push_bind(&r.agent)
                .push_bind(r.agent_priority);
        });
        qb.push(
            " ON CONFLICT (offer_jurisdiction_id)
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
        );
        qb.build().persistent(false).execute(&self.pool).await?;

        let impacted: Vec<i64> = uniques.iter().map(|r| r.offer_jurisdiction_id).collect();
        self.refresh_video_game_regional_prices(&impacted).await?;
        Ok(())
    }

    pub async fn refresh_video_game_regional_prices(
        &self,
        offer_jurisdiction_ids: &[i64],
    ) -> Result<()> {
        if offer_jurisdiction_ids.is_empty() {
            return Ok(());
        }

        let video_game_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT vg.id
             FROM video_games vg
             JOIN video_game_titles vgt ON vgt.id = vg.title_id
             JOIN sellables s ON s.software_title_id = vgt.id
             JOIN offers o ON o.sellable_id = s.id
             JOIN offer_jurisdictions oj ON oj.offer_id = o.id
             WHERE oj.id = ANY($1)",
        )
        .persistent(false)
        .bind(offer_jurisdiction_ids)
        .fetch_all(&self.pool)
        .await?;

        if video_game_ids.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "WITH price_data AS (
                SELECT
                    vg.id AS video_game_id,
                    COALESCE(
                        jsonb_agg(
                            jsonb_build_object(
                                'offer_jurisdiction_id', oj.id,
                                'region_code', COALESCE(j.region_code, co.iso2),
                                'country_iso2', co.iso2,
                                'currency_code', curr.code,
                                'amount_minor', cp.amount_minor,
                                'is_free', cp.amount_minor = 0,
                                'recorded_at', cp.recorded_at
                            )
                            ORDER BY COALESCE(j.region_code, co.iso2), curr.code
                        ),
                        '[]'::jsonb
                    ) AS prices
                FROM video_games vg
                JOIN video_game_titles vgt ON vgt.id = vg.title_id
                JOIN sellables s ON s.software_title_id = vgt.id
                JOIN offers o ON o.sellable_id = s.id
                JOIN offer_jurisdictions oj ON oj.offer_id = o.id
                JOIN current_price cp ON cp.offer_jurisdiction_id = oj.id
                JOIN jurisdictions j ON j.id = oj.jurisdiction_id
                JOIN countries co ON co.id = j.country_id
                JOIN currencies curr ON curr.id = oj.currency_id
                WHERE vg.id = ANY($1)
                GROUP BY vg.id
            )
            UPDATE video_games vg
            SET regional_prices = price_data.prices
            FROM price_data
            WHERE vg.id = price_data.video_game_id",
        )
        .persistent(false)
        .bind(&video_game_ids)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(secs: i64, prio: i16, agent: &str, amount: i64) -> CurrentPriceRow {
        CurrentPriceRow {
            offer_jurisdiction_id: 1,
            amount_minor: amount,
            recorded_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            agent: agent.to_string(),
            agent_priority: prio,
        }
    }

    #[test]
    fn newer_beyond_grace_always_wins() {
        let cur = row(0, 50, "steam", 999);
        let new = row(2, 10, "isthereanydeal", 599);
        assert!(replaces_current(&new, &cur));
    }

    #[test]
    fn within_grace_lower_priority_loses() {
        let cur = row(0, 50, "steam", 799);
        let new = row(0, 40, "isthereanydeal", 699);
        assert!(!replaces_current(&new, &cur));
    }

    #[test]
    fn equal_time_higher_priority_wins() {
        let cur = row(0, 40, "isthereanydeal", 699);
        let new = row(0, 50, "steam", 799);
        assert!(replaces_current(&new, &cur));
    }

    #[test]
    fn newer_within_grace_higher_priority_wins() {
        let cur = row(0, 40, "isthereanydeal", 699);
        let new = row(1, 50, "steam", 799);
        assert!(replaces_current(&new, &cur));
    }

    #[test]
    fn exact_tie_falls_back_to_agent_name() {
        let cur = row(0, 50, "steam", 799);
        let new = row(0, 50, "gog", 699);
        assert!(replaces_current(&new, &cur));
        assert!(!replaces_current(&cur, &new));
    }

    #[test]
    fn older_sample_never_displaces() {
        let cur = row(10, 50, "steam", 799);
        let new = row(0, 90, "epic", 199);
        assert!(!replaces_current(&new, &cur));
    }
}
