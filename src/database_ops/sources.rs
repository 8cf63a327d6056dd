//! Source registry: provider identity, raw provider items, per-retailer
//! bindings with lease-based sync scheduling, and sync-state bookkeeping.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::{PgConnection, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::database_ops::db::Db;

/// Sync lease lifetime. A scheduler that stops heartbeating loses the
/// source to the next poller after this long.
pub const SYNC_LEASE_MINUTES: i64 = 10;

/// How many error messages a sync-state row retains.
pub const MAX_SYNC_ERRORS: usize = 20;

/// Lowercase snake provider key: trimmed, non-alphanumerics collapsed to
/// single underscores.
pub fn normalize_provider_key(raw: &str) -> String {
    let mut key = String::new();
    let mut last_us = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            key.push(ch.to_ascii_lowercase());
            last_us = false;
        } else if !last_us && !key.is_empty() {
            key.push('_');
            last_us = true;
        }
    }
    key.trim_matches('_').to_string()
}

/// Keep the newest `max` messages of an error log.
pub fn cap_error_log(mut errors: Vec<String>, max: usize) -> Vec<String> {
    if errors.len() > max {
        errors.drain(..errors.len() - max);
    }
    errors
}

#[instrument(skip(db))]
pub async fn ensure_provider(
    db: &Db,
    provider_key: &str,
    name: &str,
    kind: &str,
    slug: &str,
) -> Result<i64> {
    let key = normalize_provider_key(provider_key);
    if let Some(rec) = sqlx::query("SELECT id FROM providers WHERE provider_key=$1")
        .persistent(false)
        .bind(&key)
        .fetch_optional(&db.pool)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO providers (provider_key, slug, name, kind) VALUES ($1,$2,$3,$4)
         ON CONFLICT (provider_key) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(&key)
    .bind(slug)
    .bind(name)
    .bind(kind)
    .fetch_optional(&db.pool)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM providers WHERE provider_key=$1")
        .persistent(false)
        .bind(&key)
        .fetch_one(&db.pool)
        .await?;
    Ok(rec.get("id"))
}

/// Upsert the raw per-source row keyed `(provider_id, external_id)`:
/// merge attributes, stamp last_seen_at.
#[instrument(skip(conn, attributes))]
pub async fn ensure_provider_item(
    conn: &mut PgConnection,
    provider_id: i64,
    external_id: &str,
    attributes: Option<&Value>,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO provider_items (provider_id, external_id, attributes, last_seen_at)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (provider_id, external_id) DO UPDATE
         SET attributes = CASE
                 WHEN EXCLUDED.attributes IS NULL THEN provider_items.attributes
                 ELSE COALESCE(provider_items.attributes, '{}'::jsonb) || EXCLUDED.attributes
             END,
             last_seen_at = now()
         RETURNING id",
    )
    .persistent(false)
    .bind(provider_id)
    .bind(external_id)
    .bind(attributes)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Seed one provider item for later claim/finalize enrichment: the row is
/// created unprocessed (no attributes, no last_seen_at) so the claim sweep
/// picks it up. An existing row is returned untouched.
pub async fn seed_provider_item(
    conn: &mut PgConnection,
    provider_id: i64,
    external_id: &str,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO provider_items (provider_id, external_id)
         VALUES ($1, $2)
         ON CONFLICT (provider_id, external_id) DO UPDATE SET updated_at = now()
         RETURNING id",
    )
    .persistent(false)
    .bind(provider_id)
    .bind(external_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Record that a provider has represented a title (feeds the materialized
/// source_ids array through the trigger).
pub async fn ensure_title_source(
    conn: &mut PgConnection,
    title_id: i64,
    provider_id: i64,
    external_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO video_game_title_sources (video_game_title_id, provider_id, external_id)
         VALUES ($1,$2,$3)
         ON CONFLICT (video_game_title_id, provider_id) DO NOTHING",
    )
    .persistent(false)
    .bind(title_id)
    .bind(provider_id)
    .bind(external_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn ensure_retailer_binding(db: &Db, retailer_id: i64, provider_id: i64) -> Result<i64> {
    if let Some(rec) =
        sqlx::query("SELECT id FROM retailer_provider_sources WHERE retailer_id=$1 AND provider_id=$2")
            .persistent(false)
            .bind(retailer_id)
            .bind(provider_id)
            .fetch_optional(&db.pool)
            .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO retailer_provider_sources (retailer_id, provider_id) VALUES ($1,$2)
         ON CONFLICT (retailer_id, provider_id) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(retailer_id)
    .bind(provider_id)
    .fetch_optional(&db.pool)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec =
        sqlx::query("SELECT id FROM retailer_provider_sources WHERE retailer_id=$1 AND provider_id=$2")
            .persistent(false)
            .bind(retailer_id)
            .bind(provider_id)
            .fetch_one(&db.pool)
            .await?;
    Ok(rec.get("id"))
}

/// Encrypted credential blobs are stored base64-armored so dumps and the
/// audit hash stay printable regardless of the cipher output.
pub fn encode_credentials_enc(blob: &[u8]) -> Vec<u8> {
    BASE64.encode(blob).into_bytes()
}

pub fn decode_credentials_enc(stored: &[u8]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(stored)
        .map_err(|_| anyhow!("credentials_enc is not valid base64 text"))?;
    Ok(BASE64.decode(text.trim())?)
}

/// Store (or rotate) binding credentials. The encrypted blob is armored via
/// [`encode_credentials_enc`]; the audit row is written by a trigger, and
/// only a hash of the armored payload ever reaches the audit table.
pub async fn update_binding_credentials(
    db: &Db,
    binding_id: i64,
    credentials: Option<&Value>,
    credentials_enc: Option<&[u8]>,
) -> Result<()> {
    let armored = credentials_enc.map(encode_credentials_enc);
    sqlx::query(
        "UPDATE retailer_provider_sources
         SET credentials = $2, credentials_enc = $3
         WHERE id = $1",
    )
    .persistent(false)
    .bind(binding_id)
    .bind(credentials)
    .bind(armored.as_deref())
    .execute(&db.pool)
    .await?;
    Ok(())
}

/// Read back the binding's encrypted credential blob, de-armored.
pub async fn binding_credentials_enc(db: &Db, binding_id: i64) -> Result<Option<Vec<u8>>> {
    let stored: Option<Vec<u8>> = sqlx::query_scalar(
        "SELECT credentials_enc FROM retailer_provider_sources WHERE id = $1",
    )
    .persistent(false)
    .bind(binding_id)
    .fetch_optional(&db.pool)
    .await?
    .flatten();
    stored.map(|s| decode_credentials_enc(&s)).transpose()
}

/// A source binding that is due for a sync run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DueSource {
    pub binding_id: i64,
    pub provider_id: i64,
    pub retailer_id: i64,
    pub provider_key: String,
    pub slug: String,
    pub kind: String,
    pub rate_limit_per_minute: i32,
    pub rate_limit_burst: i32,
    pub priority: i16,
    pub agent_priority: i16,
    pub sync_cursor: Option<String>,
    pub jurisdiction_scope: Vec<String>,
}

/// Enabled bindings whose next_sync_at has passed and whose lease is free or
/// expired, most urgent first.
pub async fn list_due_sources(db: &Db, now: DateTime<Utc>, limit: i64) -> Result<Vec<DueSource>> {
    let rows = sqlx::query_as::<_, DueSource>(
        "SELECT rps.id AS binding_id,
                p.id AS provider_id,
                rps.retailer_id,
                p.provider_key,
                p.slug,
                p.kind,
                COALESCE(rps.rate_limit_per_minute, p.rate_limit_per_minute) AS rate_limit_per_minute,
                COALESCE(rps.rate_limit_burst, p.rate_limit_burst) AS rate_limit_burst,
                rps.priority,
                p.agent_priority,
                rps.sync_cursor,
                rps.jurisdiction_scope
         FROM retailer_provider_sources rps
         JOIN providers p ON p.id = rps.provider_id
         WHERE rps.is_enabled
           AND rps.next_sync_at <= $1
           AND (rps.lease_token IS NULL OR rps.lease_expires_at < $1)
         ORDER BY rps.priority ASC, rps.next_sync_at ASC
         LIMIT $2",
    )
    .persistent(false)
    .bind(now)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// Highest-priority binding for a provider slug, due or not. The single
/// `ingest --source <slug>` path uses this; scheduling state is bypassed but
/// the lease is still honored.
pub async fn find_source_by_slug(db: &Db, slug: &str) -> Result<Option<DueSource>> {
    let row = sqlx::query_as::<_, DueSource>(
        "SELECT rps.id AS binding_id,
                p.id AS provider_id,
                rps.retailer_id,
                p.provider_key,
                p.slug,
                p.kind,
                COALESCE(rps.rate_limit_per_minute, p.rate_limit_per_minute) AS rate_limit_per_minute,
                COALESCE(rps.rate_limit_burst, p.rate_limit_burst) AS rate_limit_burst,
                rps.priority,
                p.agent_priority,
                rps.sync_cursor,
                rps.jurisdiction_scope
         FROM retailer_provider_sources rps
         JOIN providers p ON p.id = rps.provider_id
         WHERE p.slug = $1 AND rps.is_enabled
         ORDER BY rps.priority ASC
         LIMIT 1",
    )
    .persistent(false)
    .bind(slug)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row)
}

/// Take the sync lease for one binding. Returns None when another scheduler
/// holds a live lease.
#[instrument(skip(db))]
pub async fn claim_source_for_sync(
    db: &Db,
    binding_id: i64,
    worker_id: &str,
) -> Result<Option<Uuid>> {
    let token = Uuid::new_v4();
    let row = sqlx::query(
        "UPDATE retailer_provider_sources
         SET lease_token = $2,
             leased_by = $3,
             lease_expires_at = now() + make_interval(mins => $4::int),
             sync_status = 'running'
         WHERE id = $1
           AND (lease_token IS NULL OR lease_expires_at < now())
         RETURNING lease_token",
    )
    .persistent(false)
    .bind(binding_id)
    .bind(token)
    .bind(worker_id)
    .bind(SYNC_LEASE_MINUTES)
    .fetch_optional(&db.pool)
    .await?;
    Ok(row.map(|_| token))
}

/// Extend a held lease. Returns false when the lease was lost.
pub async fn heartbeat_sync_lease(db: &Db, binding_id: i64, token: Uuid) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE retailer_provider_sources
         SET lease_expires_at = now() + make_interval(mins => $3::int)
         WHERE id = $1 AND lease_token = $2",
    )
    .persistent(false)
    .bind(binding_id)
    .bind(token)
    .bind(SYNC_LEASE_MINUTES)
    .execute(&db.pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub status: &'static str,
    pub cursor: Option<String>,
    pub error: Option<String>,
    pub next_interval_secs: i64,
}

/// Finish a sync run: release the lease, set the status/cursor/error, and
/// schedule the next run. A lost lease makes this a no-op so a usurping
/// scheduler's bookkeeping is never overwritten.
#[instrument(skip(db, outcome))]
pub async fn finish_sync(
    db: &Db,
    binding_id: i64,
    token: Uuid,
    outcome: &SyncOutcome,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE retailer_provider_sources
         SET sync_status = $3,
             sync_cursor = COALESCE($4, sync_cursor),
             sync_error = $5,
             last_synced_at = CASE WHEN $3 IN ('ok','partial') THEN now() ELSE last_synced_at END,
             next_sync_at = now() + make_interval(secs => $6::float8),
             lease_token = NULL,
             leased_by = NULL,
             lease_expires_at = NULL
         WHERE id = $1 AND lease_token = $2",
    )
    .persistent(false)
    .bind(binding_id)
    .bind(token)
    .bind(outcome.status)
    .bind(outcome.cursor.as_deref())
    .bind(outcome.error.as_deref())
    .bind(outcome.next_interval_secs as f64)
    .execute(&db.pool)
    .await?;
    let kept = res.rows_affected() == 1;
    if !kept {
        info!(binding_id, "sync lease lost before finish; skipping bookkeeping");
    }
    Ok(kept)
}

/// Upsert the per-(provider, kind, binding) sync-state row. The error log
/// keeps the newest [`MAX_SYNC_ERRORS`] messages.
#[instrument(skip(db, details, errors))]
pub async fn record_sync_state(
    db: &Db,
    provider_id: i64,
    sync_kind: &str,
    retailer_provider_id: Option<i64>,
    status: &str,
    details: &Value,
    errors: Vec<String>,
) -> Result<()> {
    let errors = cap_error_log(errors, MAX_SYNC_ERRORS);
    sqlx::query(
        "INSERT INTO sync_states (provider_id, sync_kind, retailer_provider_id, sync_status,
                                  sync_details, error_details, last_synced_at, next_sync_at)
         VALUES ($1, $2, $3, $4, $5, $6,
                 CASE WHEN $4 IN ('ok','partial') THEN now() END, NULL)
         ON CONFLICT (provider_id, sync_kind, COALESCE(retailer_provider_id, 0)) DO UPDATE
         SET sync_status = EXCLUDED.sync_status,
             sync_details = EXCLUDED.sync_details,
             error_details = EXCLUDED.error_details,
             last_synced_at = COALESCE(EXCLUDED.last_synced_at, sync_states.last_synced_at)",
    )
    .persistent(false)
    .bind(provider_id)
    .bind(sync_kind)
    .bind(retailer_provider_id)
    .bind(status)
    .bind(details)
    .bind(json!(errors))
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_keys_collapse_to_snake() {
        assert_eq!(normalize_provider_key("PlayStation Store"), "playstation_store");
        assert_eq!(normalize_provider_key("  itch.io  "), "itch_io");
        assert_eq!(normalize_provider_key("steam"), "steam");
    }

    #[test]
    fn provider_key_normalization_is_idempotent() {
        let once = normalize_provider_key("Giant-Bomb!");
        assert_eq!(normalize_provider_key(&once), once);
    }

    #[test]
    fn credential_blobs_round_trip_through_armor() {
        let blob = [0u8, 159, 146, 150, 255];
        let armored = encode_credentials_enc(&blob);
        assert!(armored.iter().all(u8::is_ascii));
        assert_eq!(decode_credentials_enc(&armored).unwrap(), blob);
    }

    #[test]
    fn garbage_armor_is_rejected() {
        assert!(decode_credentials_enc(&[0xff, 0xfe]).is_err());
        assert!(decode_credentials_enc(b"not!base64***").is_err());
    }

    #[test]
    fn error_log_keeps_newest_entries() {
        let errors: Vec<String> = (0..30).map(|i| format!("e{i}")).collect();
        let capped = cap_error_log(errors, MAX_SYNC_ERRORS);
        assert_eq!(capped.len(), MAX_SYNC_ERRORS);
        assert_eq!(capped.first().map(String::as_str), Some("e10"));
        assert_eq!(capped.last().map(String::as_str), Some("e29"));
    }

    #[test]
    fn short_error_logs_pass_through() {
        let capped = cap_error_log(vec!["a".into()], MAX_SYNC_ERRORS);
        assert_eq!(capped, vec!["a".to_string()]);
    }
}
