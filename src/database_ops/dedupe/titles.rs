//! Title dedupe: canonical key `COALESCE(NULLIF(normalized_title,''),
//! lower(title))` scoped by product. The winner absorbs the loser's games,
//! source links, sellables, offers, and price history; the loser's name
//! survives as an alias.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{info, instrument};

use super::video_games::merge_video_game_rows;
use super::DedupeStats;
use crate::database_ops::db::Db;
use crate::normalization::title::canonical_title_key;

#[derive(Debug, Clone)]
pub struct TitleCandidate {
    pub id: i64,
    pub has_sellables: bool,
    pub has_sources: bool,
    pub created_at: DateTime<Utc>,
}

/// Winner: rows already wired into commerce or sources first, then earliest
/// created_at, then smallest id.
pub fn pick_winner(candidates: &[TitleCandidate]) -> usize {
    let mut best = 0;
    for (i, c) in candidates.iter().enumerate().skip(1) {
        let b = &candidates[best];
        let cand_key = (!(c.has_sellables || c.has_sources), c.created_at, c.id);
        let best_key = (!(b.has_sellables || b.has_sources), b.created_at, b.id);
        if cand_key < best_key {
            best = i;
        }
    }
    best
}

async fn merge_title(
    tx: &mut Transaction<'_, Postgres>,
    winner_id: i64,
    loser_id: i64,
) -> Result<()> {
    // Games whose (platform, edition) slot already exists under the winner
    // are folded into that row; the rest are repointed wholesale.
    let pairs = sqlx::query(
        "SELECT l.id AS loser_game, w.id AS winner_game
         FROM video_games l
         JOIN video_games w ON w.title_id = $1
            AND w.platform_id = l.platform_id
            AND COALESCE(w.edition,'') = COALESCE(l.edition,'')
         WHERE l.title_id = $2",
    )
    .persistent(false)
    .bind(winner_id)
    .bind(loser_id)
    .fetch_all(&mut **tx)
    .await?;
    for p in pairs {
        merge_video_game_rows(tx, p.get("winner_game"), p.get("loser_game")).await?;
    }
    sqlx::query("UPDATE video_games SET title_id = $1 WHERE title_id = $2")
        .persistent(false)
        .bind(winner_id)
        .bind(loser_id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "UPDATE video_game_title_sources ts SET video_game_title_id = $1
         WHERE ts.video_game_title_id = $2
           AND NOT EXISTS (
               SELECT 1 FROM video_game_title_sources w
               WHERE w.video_game_title_id = $1 AND w.provider_id = ts.provider_id)",
    )
    .persistent(false)
    .bind(winner_id)
    .bind(loser_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM video_game_title_sources WHERE video_game_title_id = $1")
        .persistent(false)
        .bind(loser_id)
        .execute(&mut **tx)
        .await?;

    merge_sellables(tx, winner_id, loser_id).await?;

    sqlx::query(
        "INSERT INTO video_game_title_dedupe_audit (winner_id, loser_id, loser_attributes)
         SELECT $1, t.id, to_jsonb(t) FROM video_game_titles t WHERE t.id = $2",
    )
    .persistent(false)
    .bind(winner_id)
    .bind(loser_id)
    .execute(&mut **tx)
    .await?;

    // Keep the loser's name findable.
    sqlx::query(
        "UPDATE video_game_titles w
         SET aliases = (SELECT COALESCE(array_agg(DISTINCT x), '{}')
                        FROM unnest(w.aliases || l.title || l.aliases) x)
         FROM video_game_titles l
         WHERE w.id = $1 AND l.id = $2",
    )
    .persistent(false)
    .bind(winner_id)
    .bind(loser_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM video_game_titles WHERE id = $1")
        .persistent(false)
        .bind(loser_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Reassign the loser title's sellable (and everything hanging off it) so
/// no offer or price sample is lost to the merge.
async fn merge_sellables(
    tx: &mut Transaction<'_, Postgres>,
    winner_id: i64,
    loser_id: i64,
) -> Result<()> {
    let loser_sellable: Option<i64> =
        sqlx::query_scalar("SELECT id FROM sellables WHERE software_title_id = $1")
            .persistent(false)
            .bind(loser_id)
            .fetch_optional(&mut **tx)
            .await?;
    let Some(ls) = loser_sellable else {
        return Ok(());
    };
    let winner_sellable: Option<i64> =
        sqlx::query_scalar("SELECT id FROM sellables WHERE software_title_id = $1")
            .persistent(false)
            .bind(winner_id)
            .fetch_optional(&mut **tx)
            .await?;
    let Some(ws) = winner_sellable else {
        sqlx::query("UPDATE sellables SET software_title_id = $1 WHERE id = $2")
            .persistent(false)
            .bind(winner_id)
            .bind(ls)
            .execute(&mut **tx)
            .await?;
        return Ok(());
    };

    // Offers that don't collide on (retailer, sku) move over directly.
    sqlx::query(
        "UPDATE offers o SET sellable_id = $1
         WHERE o.sellable_id = $2
           AND NOT EXISTS (
               SELECT 1 FROM offers w
               WHERE w.sellable_id = $1 AND w.retailer_id = o.retailer_id
                 AND COALESCE(w.sku,'') = COALESCE(o.sku,''))",
    )
    .persistent(false)
    .bind(ws)
    .bind(ls)
    .execute(&mut **tx)
    .await?;

    // Colliding offers: move their jurisdictions across to the surviving
    // offer where the jurisdiction slot is free.
    sqlx::query(
        "UPDATE offer_jurisdictions oj SET offer_id = w.id
         FROM offers l, offers w
         WHERE oj.offer_id = l.id
           AND l.sellable_id = $2
           AND w.sellable_id = $1
           AND w.retailer_id = l.retailer_id
           AND COALESCE(w.sku,'') = COALESCE(l.sku,'')
           AND NOT EXISTS (
               SELECT 1 FROM offer_jurisdictions x
               WHERE x.offer_id = w.id AND x.jurisdiction_id = oj.jurisdiction_id)",
    )
    .persistent(false)
    .bind(ws)
    .bind(ls)
    .execute(&mut **tx)
    .await?;

    // Jurisdictions present on both sides: fold price history and the
    // current-price row into the winner's slot, then drop the duplicate.
    let oj_pairs = sqlx::query(
        "SELECT loj.id AS loser_oj, woj.id AS winner_oj
         FROM offer_jurisdictions loj
         JOIN offers l ON l.id = loj.offer_id AND l.sellable_id = $2
         JOIN offers w ON w.sellable_id = $1
            AND w.retailer_id = l.retailer_id
            AND COALESCE(w.sku,'') = COALESCE(l.sku,'')
         JOIN offer_jurisdictions woj ON woj.offer_id = w.id
            AND woj.jurisdiction_id = loj.jurisdiction_id",
    )
    .persistent(false)
    .bind(ws)
    .bind(ls)
    .fetch_all(&mut **tx)
    .await?;
    for p in oj_pairs {
        let loser_oj: i64 = p.get("loser_oj");
        let winner_oj: i64 = p.get("winner_oj");
        sqlx::query("UPDATE prices SET offer_jurisdiction_id = $1 WHERE offer_jurisdiction_id = $2")
            .persistent(false)
            .bind(winner_oj)
            .bind(loser_oj)
            .execute(&mut **tx)
            .await?;
        sqlx::query(
            "INSERT INTO current_price (offer_jurisdiction_id, amount_minor, recorded_at, agent, agent_priority)
             SELECT $1, amount_minor, recorded_at, agent, agent_priority
             FROM current_price WHERE offer_jurisdiction_id = $2
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
        .bind(winner_oj)
        .bind(loser_oj)
        .execute(&mut **tx)
        .await?;
        sqlx::query("DELETE FROM current_price WHERE offer_jurisdiction_id = $1")
            .persistent(false)
            .bind(loser_oj)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM offer_jurisdictions WHERE id = $1")
            .persistent(false)
            .bind(loser_oj)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query("DELETE FROM offers WHERE sellable_id = $1")
        .persistent(false)
        .bind(ls)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM sellables WHERE id = $1")
        .persistent(false)
        .bind(ls)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Sweep all titles for duplicate canonical keys within a product and merge
/// each group down to its winner.
#[instrument(skip(db))]
pub async fn dedupe_titles(db: &Db, apply: bool) -> Result<DedupeStats> {
    let rows = sqlx::query(
        "SELECT t.id, t.product_id, t.title, t.normalized_title, t.created_at,
                EXISTS (SELECT 1 FROM sellables s WHERE s.software_title_id = t.id) AS has_sellables,
                EXISTS (SELECT 1 FROM video_game_title_sources ts WHERE ts.video_game_title_id = t.id) AS has_sources
         FROM video_game_titles t",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await?;

    let mut groups: HashMap<(i64, String), Vec<TitleCandidate>> = HashMap::new();
    for r in rows {
        let product_id: i64 = r.get("product_id");
        let title: String = r.get("title");
        let normalized: String = r.get("normalized_title");
        let key = canonical_title_key(&normalized, &title);
        groups
            .entry((product_id, key))
            .or_default()
            .push(TitleCandidate {
                id: r.get("id"),
                has_sellables: r.get("has_sellables"),
                has_sources: r.get("has_sources"),
                created_at: r.get("created_at"),
            });
    }

    let mut stats = DedupeStats::default();
    for (_, candidates) in groups {
        if candidates.len() < 2 {
            continue;
        }
        stats.groups += 1;
        let winner = candidates[pick_winner(&candidates)].id;

        if !apply {
            info!(winner, losers = candidates.len() - 1, "title dedupe dry-run group");
            continue;
        }

        let mut tx = db.pool.begin().await?;
        for c in &candidates {
            if c.id == winner {
                continue;
            }
            merge_title(&mut tx, winner, c.id).await?;
            stats.merged += 1;
        }
        tx.commit().await?;
    }
    info!(groups = stats.groups, merged = stats.merged, "title dedupe done");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cand(id: i64, sellables: bool, sources: bool, secs: i64) -> TitleCandidate {
        TitleCandidate {
            id,
            has_sellables: sellables,
            has_sources: sources,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn commerce_wired_title_wins() {
        let c = vec![cand(1, false, false, 0), cand(2, true, false, 500)];
        assert_eq!(c[pick_winner(&c)].id, 2);
    }

    #[test]
    fn sources_count_as_wiring_too() {
        let c = vec![cand(1, false, false, 0), cand(2, false, true, 500)];
        assert_eq!(c[pick_winner(&c)].id, 2);
    }

    #[test]
    fn earliest_then_smallest_id() {
        let c = vec![cand(9, true, false, 100), cand(4, true, true, 100), cand(7, true, false, 0)];
        assert_eq!(c[pick_winner(&c)].id, 7);
        let c = vec![cand(9, false, false, 0), cand(4, false, false, 0)];
        assert_eq!(c[pick_winner(&c)].id, 4);
    }
}
