//! Video-game dedupe: duplicate key `(title_id, platform_id,
//! COALESCE(edition,''))`. The winner keeps its media and ratings; the
//! loser's rows are repointed where the composite keys allow and dropped
//! where they collide.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, instrument};

use super::DedupeStats;
use crate::database_ops::db::Db;

#[derive(Debug, Clone)]
pub struct GameCandidate {
    pub id: i64,
    pub has_media: bool,
    pub created_at: DateTime<Utc>,
}

/// Winner: media-bearing rows first, then earliest created_at, then
/// smallest id. Returns the index into `candidates`.
pub fn pick_winner(candidates: &[GameCandidate]) -> usize {
    let mut best = 0;
    for (i, c) in candidates.iter().enumerate().skip(1) {
        let b = &candidates[best];
        let cand_key = (!c.has_media, c.created_at, c.id);
        let best_key = (!b.has_media, b.created_at, b.id);
        if cand_key < best_key {
            best = i;
        }
    }
    best
}

/// Fold one video_game row into another: repoint media and ratings where the
/// unique keys allow, drop what collides, audit, delete the loser. Runs
/// inside the caller's transaction.
pub(crate) async fn merge_video_game_rows(
    tx: &mut Transaction<'_, Postgres>,
    winner_id: i64,
    loser_id: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE game_media gm SET video_game_id = $1
         WHERE gm.video_game_id = $2
           AND NOT EXISTS (
               SELECT 1 FROM game_media w
               WHERE w.video_game_id = $1 AND w.source = gm.source AND w.external_id = gm.external_id)",
    )
    .persistent(false)
    .bind(winner_id)
    .bind(loser_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM game_media WHERE video_game_id = $1")
        .persistent(false)
        .bind(loser_id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "UPDATE game_ratings gr SET video_game_id = $1
         WHERE gr.video_game_id = $2
           AND NOT EXISTS (
               SELECT 1 FROM game_ratings w
               WHERE w.video_game_id = $1 AND w.source = gr.source)",
    )
    .persistent(false)
    .bind(winner_id)
    .bind(loser_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM game_ratings WHERE video_game_id = $1")
        .persistent(false)
        .bind(loser_id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "INSERT INTO video_game_dedupe_audit (winner_id, loser_id, loser_attributes)
         SELECT $1, vg.id, to_jsonb(vg) FROM video_games vg WHERE vg.id = $2",
    )
    .persistent(false)
    .bind(winner_id)
    .bind(loser_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM video_games WHERE id = $1")
        .persistent(false)
        .bind(loser_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Sweep for duplicate `(title_id, platform_id, edition)` groups and merge
/// each group down to its winner.
#[instrument(skip(db))]
pub async fn dedupe_video_games(db: &Db, apply: bool) -> Result<DedupeStats> {
    let groups = sqlx::query(
        "SELECT title_id, platform_id, COALESCE(edition,'') AS edition_key, array_agg(id ORDER BY id) AS ids
         FROM video_games
         GROUP BY title_id, platform_id, COALESCE(edition,'')
         HAVING count(*) > 1",
    )
    .persistent(false)
    .fetch_all(&db.pool)
    .await?;

    let mut stats = DedupeStats::default();
    for g in groups {
        stats.groups += 1;
        let ids: Vec<i64> = g.get("ids");
        let rows = sqlx::query(
            "SELECT vg.id, vg.created_at,
                    EXISTS (SELECT 1 FROM game_media gm WHERE gm.video_game_id = vg.id)
                 OR EXISTS (SELECT 1 FROM game_ratings gr WHERE gr.video_game_id = vg.id) AS has_media
             FROM video_games vg WHERE vg.id = ANY($1)",
        )
        .persistent(false)
        .bind(&ids)
        .fetch_all(&db.pool)
        .await?;
        let candidates: Vec<GameCandidate> = rows
            .into_iter()
            .map(|r| GameCandidate {
                id: r.get("id"),
                has_media: r.get("has_media"),
                created_at: r.get("created_at"),
            })
            .collect();
        if candidates.len() < 2 {
            continue;
        }
        let winner = candidates[pick_winner(&candidates)].id;

        if !apply {
            info!(winner, losers = candidates.len() - 1, "video-game dedupe dry-run group");
            continue;
        }

        let mut tx = db.pool.begin().await?;
        for c in &candidates {
            if c.id == winner {
                continue;
            }
            merge_video_game_rows(&mut tx, winner, c.id).await?;
            stats.merged += 1;
        }
        tx.commit().await?;
    }
    info!(groups = stats.groups, merged = stats.merged, "video-game dedupe done");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cand(id: i64, has_media: bool, secs: i64) -> GameCandidate {
        GameCandidate {
            id,
            has_media,
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn media_bearing_row_wins_over_older_empty_row() {
        let c = vec![cand(1, false, 0), cand(2, true, 100)];
        assert_eq!(c[pick_winner(&c)].id, 2);
    }

    #[test]
    fn earliest_created_wins_when_media_ties() {
        let c = vec![cand(5, true, 100), cand(9, true, 0)];
        assert_eq!(c[pick_winner(&c)].id, 9);
    }

    #[test]
    fn smallest_id_is_the_final_tiebreak() {
        let c = vec![cand(7, false, 0), cand(3, false, 0)];
        assert_eq!(c[pick_winner(&c)].id, 3);
    }
}
