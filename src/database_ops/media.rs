//! Media store: canonical deduplicated URLs plus the per-game and per-source
//! link tables. Every media URL entering the system is routed through
//! [`ensure_canonical_media`] so identical URLs collapse to one row.

use anyhow::{anyhow, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, Row};
use tracing::{debug, info, instrument};
use url::Url;

use crate::database_ops::db::Db;

/// Media URLs must parse as absolute http(s) URLs before they reach the
/// canonical store; anything else fails the record it arrived on.
pub fn validate_media_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| anyhow!("invalid media url {url}: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(anyhow!(
            "unsupported media url scheme {} in {url}",
            parsed.scheme()
        ));
    }
    Ok(())
}

/// Hex sha256 of a media URL. Must agree with the DB-side
/// `canonical_media_url_hash` so app- and trigger-written rows collide on
/// the same unique key.
pub fn url_hash(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Storage kind for a media_type label.
pub fn media_kind_for_type(media_type: &str) -> &'static str {
    match media_type {
        "trailer" | "gameplay" => "video",
        _ => "image",
    }
}

/// Allowed media_type labels (everything else is coerced to "preview").
pub fn normalize_media_type(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "cover" | "boxart" | "box_art" => "cover",
        "hero" | "banner" => "hero",
        "screenshot" | "screen" => "screenshot",
        "artwork" | "art" => "artwork",
        "trailer" => "trailer",
        "gameplay" => "gameplay",
        "logo" => "logo",
        "icon" => "icon",
        "background" => "background",
        _ => "preview",
    }
}

/// Get-or-create the canonical row for a URL. Re-sighting bumps
/// access_count and backfills metadata that was previously unknown.
#[instrument(skip(conn))]
pub async fn ensure_canonical_media(
    conn: &mut PgConnection,
    url: &str,
    width: Option<i32>,
    height: Option<i32>,
    mime_type: Option<&str>,
    size_bytes: Option<i64>,
    content_hash: Option<&str>,
) -> Result<i64> {
    validate_media_url(url)?;

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO canonical_media (url, url_hash, width, height, mime_type, size_bytes, hash)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (url_hash) DO UPDATE
         SET access_count = canonical_media.access_count + 1,
             width = COALESCE(canonical_media.width, EXCLUDED.width),
             height = COALESCE(canonical_media.height, EXCLUDED.height),
             mime_type = COALESCE(canonical_media.mime_type, EXCLUDED.mime_type),
             size_bytes = COALESCE(canonical_media.size_bytes, EXCLUDED.size_bytes),
             hash = COALESCE(canonical_media.hash, EXCLUDED.hash)
         RETURNING id",
    )
    .persistent(false)
    .bind(url)
    .bind(url_hash(url))
    .bind(width)
    .bind(height)
    .bind(mime_type)
    .bind(size_bytes)
    .bind(content_hash)
    .fetch_one(&mut *conn)
    .await?;

    debug!(canonical_media_id = id, "ensured canonical media");
    Ok(id)
}

#[derive(Debug, Clone)]
pub struct GameMediaUpsert<'a> {
    pub video_game_id: i64,
    pub source: &'a str,
    pub external_id: &'a str,
    pub media_type: &'a str,
    pub url: &'a str,
    pub stream_url: Option<&'a str>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub mime_type: Option<&'a str>,
    pub provider_data: Value,
}

/// Upsert one game_media row on the `(video_game_id, source, external_id)`
/// composite key, linking it to the canonical media entry for its URL.
#[instrument(skip(conn, row), fields(video_game_id = row.video_game_id, source = row.source))]
pub async fn upsert_game_media(conn: &mut PgConnection, row: &GameMediaUpsert<'_>) -> Result<()> {
    let media_type = normalize_media_type(row.media_type);
    let kind = media_kind_for_type(media_type);
    let canonical_id = ensure_canonical_media(
        &mut *conn,
        row.url,
        row.width,
        row.height,
        row.mime_type,
        None,
        None,
    )
    .await?;

    sqlx::query(
        "INSERT INTO game_media (video_game_id, source, external_id, kind, media_type, title,
                                 url, stream_url, width, height, mime_type, provider_data,
                                 canonical_media_id)
         VALUES ($1,$2,$3,$4,$5,$5,$6,$7,$8,$9,$10,$11,$12)
         ON CONFLICT (video_game_id, source, external_id) DO UPDATE
         SET url = EXCLUDED.url,
             stream_url = EXCLUDED.stream_url,
             kind = EXCLUDED.kind,
             media_type = EXCLUDED.media_type,
             provider_data = EXCLUDED.provider_data,
             canonical_media_id = EXCLUDED.canonical_media_id,
             width = COALESCE(EXCLUDED.width, game_media.width),
             height = COALESCE(EXCLUDED.height, game_media.height),
             mime_type = COALESCE(EXCLUDED.mime_type, game_media.mime_type)",
    )
    .persistent(false)
    .bind(row.video_game_id)
    .bind(row.source)
    .bind(row.external_id)
    .bind(kind)
    .bind(media_type)
    .bind(row.url)
    .bind(row.stream_url)
    .bind(row.width)
    .bind(row.height)
    .bind(row.mime_type)
    .bind(&row.provider_data)
    .bind(canonical_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Raw per-source media link, unique on `(video_game_source_id, url)`.
pub async fn ensure_vg_source_media_link(
    conn: &mut PgConnection,
    video_game_source_id: i64,
    url: &str,
    media_group: Option<&str>,
    role: Option<&str>,
    meta: &Value,
) -> Result<i64> {
    validate_media_url(url)?;
    let canonical_id =
        ensure_canonical_media(&mut *conn, url, None, None, None, None, None).await?;
    if let Some(rec) = sqlx::query(
        "SELECT id FROM vg_source_media_links WHERE video_game_source_id=$1 AND url=$2",
    )
    .persistent(false)
    .bind(video_game_source_id)
    .bind(url)
    .fetch_optional(&mut *conn)
    .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO vg_source_media_links (video_game_source_id, url, media_group, role, meta, canonical_media_id)
         VALUES ($1,$2,$3,$4,$5,$6)
         ON CONFLICT (video_game_source_id, url) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(video_game_source_id)
    .bind(url)
    .bind(media_group)
    .bind(role)
    .bind(meta)
    .bind(canonical_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query(
        "SELECT id FROM vg_source_media_links WHERE video_game_source_id=$1 AND url=$2",
    )
    .persistent(false)
    .bind(video_game_source_id)
    .bind(url)
    .fetch_one(&mut *conn)
    .await?;
    Ok(rec.get("id"))
}

/// Backfill canonical_media links for game_media rows that predate the
/// canonical store. Batched; idempotent via the composite key.
#[instrument(skip(db))]
pub async fn backfill_game_media_canonical(db: &Db, batch_size: i64, apply: bool) -> Result<i64> {
    if !apply {
        let pending: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM game_media WHERE canonical_media_id IS NULL",
        )
        .persistent(false)
        .fetch_one(&db.pool)
        .await?;
        info!(pending, "backfill dry-run; pass --apply to link rows");
        return Ok(pending);
    }

    let mut total = 0i64;
    loop {
        let res = sqlx::query(
            "WITH batch AS (
                SELECT video_game_id, source, external_id, url
                FROM game_media
                WHERE canonical_media_id IS NULL
                LIMIT $1
             ),
             canon AS (
                INSERT INTO canonical_media (url, url_hash)
                SELECT DISTINCT url, canonical_media_url_hash(url) FROM batch
                ON CONFLICT (url_hash) DO UPDATE
                SET access_count = canonical_media.access_count + 1
                RETURNING id, url_hash
             )
             UPDATE game_media gm
             SET canonical_media_id = c.id
             FROM batch b
             JOIN canon c ON c.url_hash = canonical_media_url_hash(b.url)
             WHERE gm.video_game_id = b.video_game_id
               AND gm.source = b.source
               AND gm.external_id = b.external_id",
        )
        .persistent(false)
        .bind(batch_size)
        .execute(&db.pool)
        .await?;
        let n = res.rows_affected() as i64;
        total += n;
        if n < batch_size {
            break;
        }
    }
    info!(linked = total, "backfilled canonical media links");
    Ok(total)
}

/// Remove canonical_media rows with zero references older than the
/// threshold. Dry-run by default.
#[instrument(skip(db))]
pub async fn cleanup_unused_canonical_media(
    db: &Db,
    min_age_days: i64,
    apply: bool,
) -> Result<i64> {
    let candidates: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM canonical_media cm
         WHERE cm.created_at < now() - make_interval(days => $1::int)
           AND NOT EXISTS (SELECT 1 FROM game_media gm WHERE gm.canonical_media_id = cm.id)
           AND NOT EXISTS (SELECT 1 FROM vg_source_media_links ml WHERE ml.canonical_media_id = cm.id)",
    )
    .persistent(false)
    .bind(min_age_days)
    .fetch_one(&db.pool)
    .await?;

    if !apply {
        info!(candidates, "cleanup dry-run; pass --apply to delete");
        return Ok(candidates);
    }

    let res = sqlx::query(
        "DELETE FROM canonical_media cm
         WHERE cm.created_at < now() - make_interval(days => $1::int)
           AND NOT EXISTS (SELECT 1 FROM game_media gm WHERE gm.canonical_media_id = cm.id)
           AND NOT EXISTS (SELECT 1 FROM vg_source_media_links ml WHERE ml.canonical_media_id = cm.id)",
    )
    .persistent(false)
    .bind(min_age_days)
    .execute(&db.pool)
    .await?;
    info!(deleted = res.rows_affected(), "deleted unused canonical media");
    Ok(res.rows_affected() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_hash_matches_known_sha256() {
        // sha256("") is the canonical empty-string digest.
        assert_eq!(
            url_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(url_hash("a").len(), 64);
        assert_eq!(url_hash("https://x/1.jpg"), url_hash("https://x/1.jpg"));
        assert_ne!(url_hash("https://x/1.jpg"), url_hash("https://x/2.jpg"));
    }

    #[test]
    fn media_urls_must_be_absolute_http() {
        assert!(validate_media_url("https://images.example/cover.jpg").is_ok());
        assert!(validate_media_url("http://cdn.example/shot.png?size=l").is_ok());
        assert!(validate_media_url("").is_err());
        assert!(validate_media_url("not a url").is_err());
        assert!(validate_media_url("/relative/path.jpg").is_err());
        assert!(validate_media_url("ftp://host/file.jpg").is_err());
    }

    #[test]
    fn kind_follows_media_type() {
        assert_eq!(media_kind_for_type("trailer"), "video");
        assert_eq!(media_kind_for_type("gameplay"), "video");
        assert_eq!(media_kind_for_type("cover"), "image");
        assert_eq!(media_kind_for_type("screenshot"), "image");
    }

    #[test]
    fn unknown_media_types_become_preview() {
        assert_eq!(normalize_media_type("weird"), "preview");
        assert_eq!(normalize_media_type("BoxArt"), "cover");
        assert_eq!(normalize_media_type(" banner "), "hero");
    }
}
