//! Platform dedupe: rows that resolve to the same canonical code under the
//! current alias table are merged. Historical rows created before an alias
//! landed (`ps4` next to `playstation-4`) are the usual source of groups.

use anyhow::Result;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{info, instrument};

use super::video_games::merge_video_game_rows;
use super::DedupeStats;
use crate::database_ops::db::Db;
use crate::normalization::platform::resolve_platform_alias;

#[derive(Debug, Clone)]
struct PlatformRow {
    id: i64,
    code: String,
}

/// Winner within a group: the row whose stored code already equals the
/// resolved canonical code, else the smallest id (the longest-lived row).
pub fn pick_winner_index(codes: &[(i64, String)], resolved_code: &str) -> usize {
    let mut best: Option<usize> = None;
    for (i, (id, code)) in codes.iter().enumerate() {
        if code == resolved_code {
            match best {
                Some(b) if codes[b].1 == resolved_code && codes[b].0 <= *id => {}
                _ => best = Some(i),
            }
        }
    }
    if let Some(i) = best {
        return i;
    }
    codes
        .iter()
        .enumerate()
        .min_by_key(|(_, (id, _))| *id)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Merge all platform alias groups. Each merge repoints `video_games`,
/// folds colliding games into the winner's row, audits, and deletes the
/// loser platform.
#[instrument(skip(db))]
pub async fn dedupe_platforms(db: &Db, apply: bool) -> Result<DedupeStats> {
    let rows = sqlx::query("SELECT id, code FROM platforms ORDER BY id")
        .persistent(false)
        .fetch_all(&db.pool)
        .await?;
    let platforms: Vec<PlatformRow> = rows
        .into_iter()
        .map(|r| PlatformRow {
            id: r.get("id"),
            code: r.get("code"),
        })
        .collect();

    let mut groups: HashMap<String, Vec<PlatformRow>> = HashMap::new();
    for p in platforms {
        let resolved = resolve_platform_alias(&p.code).code;
        groups.entry(resolved).or_default().push(p);
    }

    let mut stats = DedupeStats::default();
    for (resolved_code, members) in groups {
        if members.len() < 2 {
            continue;
        }
        stats.groups += 1;
        let pairs: Vec<(i64, String)> =
            members.iter().map(|m| (m.id, m.code.clone())).collect();
        let winner = &members[pick_winner_index(&pairs, &resolved_code)];

        if !apply {
            info!(winner = winner.id, code = %resolved_code, losers = members.len() - 1,
                  "platform dedupe dry-run group");
            continue;
        }

        for loser in members.iter().filter(|m| m.id != winner.id) {
            let mut tx = db.pool.begin().await?;

            // Games colliding on (title, platform, edition) after the
            // repoint are folded into the winner's row first.
            let conflicts = sqlx::query(
                "SELECT l.id AS loser_game, w.id AS winner_game
                 FROM video_games l
                 JOIN video_games w ON w.platform_id = $1
                    AND w.title_id = l.title_id
                    AND COALESCE(w.edition,'') = COALESCE(l.edition,'')
                 WHERE l.platform_id = $2",
            )
            .persistent(false)
            .bind(winner.id)
            .bind(loser.id)
            .fetch_all(&mut *tx)
            .await?;
            for c in conflicts {
                merge_video_game_rows(&mut tx, c.get("winner_game"), c.get("loser_game")).await?;
            }

            let repointed = sqlx::query(
                "UPDATE video_games SET platform_id = $1 WHERE platform_id = $2",
            )
            .persistent(false)
            .bind(winner.id)
            .bind(loser.id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO platform_merge_audit (old_id, new_id, old_code, new_code, merged_rows)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .persistent(false)
            .bind(loser.id)
            .bind(winner.id)
            .bind(&loser.code)
            .bind(&winner.code)
            .bind(repointed.rows_affected() as i64)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM platforms WHERE id = $1")
                .persistent(false)
                .bind(loser.id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            stats.merged += 1;
        }
    }
    info!(groups = stats.groups, merged = stats.merged, "platform dedupe done");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalization::platform::canonical_platform_code;

    #[test]
    fn canonical_spelling_wins() {
        let rows = vec![(1, "ps4".to_string()), (2, "playstation-4".to_string())];
        assert_eq!(pick_winner_index(&rows, "playstation-4"), 1);
    }

    #[test]
    fn smallest_id_wins_without_canonical_spelling() {
        let rows = vec![(9, "ps4".to_string()), (3, "PS 4".to_string())];
        assert_eq!(pick_winner_index(&rows, "playstation-4"), 1);
    }

    #[test]
    fn ties_on_canonical_spelling_prefer_smallest_id() {
        let rows = vec![
            (5, "playstation-4".to_string()),
            (2, "playstation-4".to_string()),
        ];
        assert_eq!(pick_winner_index(&rows, "playstation-4"), 1);
    }

    #[test]
    fn alias_groups_share_a_resolved_code() {
        assert_eq!(
            resolve_platform_alias("ps4").code,
            resolve_platform_alias("PlayStation 4").code
        );
        assert_eq!(canonical_platform_code("playstation-4"), "playstation4");
    }
}
