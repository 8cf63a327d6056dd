//! Canonical store get-or-create primitives. Every function here is an
//! idempotent upsert over the relevant unique key: SELECT first, then
//! `INSERT ... ON CONFLICT DO NOTHING RETURNING id`, then one re-read when
//! the insert lost a race. Safe to retry under READ COMMITTED.

use anyhow::Result;
use sqlx::{PgConnection, Row};
use tracing::instrument;


use crate::normalization::platform::{
    canonical_platform_code, resolve_platform_alias, PlatformKey, MIN_PLATFORM_SIMILARITY,
};
use crate::normalization::title::normalize_title;

/// Minor-unit exponent per ISO currency. Default 2; the zero- and
/// three-decimal sets are authoritative overrides.
pub fn currency_minor_unit(code: &str) -> i16 {
    match code.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "HUF" => 0,
        "BHD" | "IQD" | "KWD" | "JOD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Currency spoken in a country, for jurisdictions bootstrapped from a bare
/// ISO-2 country code.
pub fn currency_for_country(iso2: &str) -> (&'static str, &'static str) {
    match iso2.to_ascii_uppercase().as_str() {
        "US" => ("USD", "United States Dollar"),
        "GB" => ("GBP", "British Pound Sterling"),
        "DE" | "FR" | "ES" | "IT" | "NL" | "AT" | "BE" | "FI" | "IE" | "PT" => ("EUR", "Euro"),
        "JP" => ("JPY", "Japanese Yen"),
        "CA" => ("CAD", "Canadian Dollar"),
        "AU" => ("AUD", "Australian Dollar"),
        "NZ" => ("NZD", "New Zealand Dollar"),
        "CH" => ("CHF", "Swiss Franc"),
        "CN" => ("CNY", "Chinese Yuan"),
        "KR" => ("KRW", "South Korean Won"),
        "SG" => ("SGD", "Singapore Dollar"),
        "HK" => ("HKD", "Hong Kong Dollar"),
        "NO" => ("NOK", "Norwegian Krone"),
        "SE" => ("SEK", "Swedish Krona"),
        "DK" => ("DKK", "Danish Krone"),
        "PL" => ("PLN", "Polish Zloty"),
        "CZ" => ("CZK", "Czech Koruna"),
        "HU" => ("HUF", "Hungarian Forint"),
        "IN" => ("INR", "Indian Rupee"),
        "BR" => ("BRL", "Brazilian Real"),
        "MX" => ("MXN", "Mexican Peso"),
        "ZA" => ("ZAR", "South African Rand"),
        "TH" => ("THB", "Thai Baht"),
        "TR" => ("TRY", "Turkish Lira"),
        "IL" => ("ILS", "Israeli New Shekel"),
        "AE" => ("AED", "UAE Dirham"),
        "SA" => ("SAR", "Saudi Riyal"),
        "RU" => ("RUB", "Russian Ruble"),
        _ => ("USD", "United States Dollar"),
    }
}

pub fn iso3_from_iso2(code: &str) -> Option<&'static str> {
    Some(match code.to_ascii_uppercase().as_str() {
        "US" => "USA",
        "GB" => "GBR",
        "DE" => "DEU",
        "FR" => "FRA",
        "ES" => "ESP",
        "IT" => "ITA",
        "NL" => "NLD",
        "JP" => "JPN",
        "CA" => "CAN",
        "AU" => "AUS",
        "NZ" => "NZL",
        "CH" => "CHE",
        "CN" => "CHN",
        "KR" => "KOR",
        "SG" => "SGP",
        "HK" => "HKG",
        "NO" => "NOR",
        "SE" => "SWE",
        "DK" => "DNK",
        "PL" => "POL",
        "CZ" => "CZE",
        "HU" => "HUN",
        "IN" => "IND",
        "BR" => "BRA",
        "MX" => "MEX",
        "ZA" => "ZAF",
        "TH" => "THA",
        "TR" => "TUR",
        "IL" => "ISR",
        "AE" => "ARE",
        "SA" => "SAU",
        "RU" => "RUS",
        _ => return None,
    })
}

pub async fn ensure_currency(conn: &mut PgConnection, code: &str, name: &str, minor_unit: i16) -> Result<i64> {
    let code = code.trim().to_ascii_uppercase();
    if let Some(rec) = sqlx::query("SELECT id FROM currencies WHERE code=$1")
        .persistent(false)
        .bind(&code)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO currencies (code, name, minor_unit) VALUES ($1,$2,$3)
         ON CONFLICT (code) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(&code)
    .bind(name)
    .bind(minor_unit)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM currencies WHERE code=$1")
        .persistent(false)
        .bind(&code)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

pub async fn ensure_country(conn: &mut PgConnection, iso2: &str, name: &str, currency_id: i64) -> Result<i64> {
    let iso2 = iso2.trim().to_ascii_uppercase();
    if let Some(rec) = sqlx::query("SELECT id FROM countries WHERE iso2=$1")
        .persistent(false)
        .bind(&iso2)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO countries (iso2, iso3, name, currency_id) VALUES ($1,$2,$3,$4)
         ON CONFLICT (iso2) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(&iso2)
    .bind(iso3_from_iso2(&iso2))
    .bind(name)
    .bind(currency_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM countries WHERE iso2=$1")
        .persistent(false)
        .bind(&iso2)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

/// National jurisdiction when region_code is None, sub-national otherwise.
pub async fn ensure_jurisdiction(
    conn: &mut PgConnection,
    country_id: i64,
    region_code: Option<&str>,
) -> Result<i64> {
    let region = region_code.map(|r| r.trim().to_ascii_uppercase());
    if let Some(rec) = sqlx::query(
        "SELECT id FROM jurisdictions WHERE country_id=$1 AND COALESCE(region_code,'')=COALESCE($2,'')",
    )
    .persistent(false)
    .bind(country_id)
    .bind(region.as_deref())
    .fetch_optional(&mut *conn)
    .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO jurisdictions (country_id, region_code) VALUES ($1,$2)
         ON CONFLICT (country_id, COALESCE(region_code,'')) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(country_id)
    .bind(region.as_deref())
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query(
        "SELECT id FROM jurisdictions WHERE country_id=$1 AND COALESCE(region_code,'')=COALESCE($2,'')",
    )
    .persistent(false)
    .bind(country_id)
    .bind(region.as_deref())
    .fetch_one(&mut *conn)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip(conn))]
pub async fn ensure_product(conn: &mut PgConnection, slug: &str, name: &str, category: &str) -> Result<i64> {
    if let Some(rec) = sqlx::query("SELECT id FROM products WHERE slug=$1")
        .persistent(false)
        .bind(slug)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO products (slug, name, category) VALUES ($1,$2,$3)
         ON CONFLICT (slug) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(slug)
    .bind(name)
    .bind(category)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM products WHERE slug=$1")
        .persistent(false)
        .bind(slug)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

/// Resolve a raw platform label to the canonical row, creating it on first
/// sighting. Alias resolution and the Jaro-Winkler fallback both run before
/// any insert so `ps4` and `PlayStation 4` land on one row.
#[instrument(skip(conn))]
pub async fn ensure_platform(conn: &mut PgConnection, code: &str, name: &str) -> Result<i64> {
    let raw = if code.trim().is_empty() { name } else { code };
    let desc = resolve_platform_alias(raw);
    let canonical = canonical_platform_code(&desc.code);

    if let Some(rec) = sqlx::query("SELECT id FROM platforms WHERE canonical_code=$1")
        .persistent(false)
        .bind(&canonical)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }

    // Fuzzy fallback (Jaro-Winkler >= 0.80, numeric generations kept apart)
    // collapses spellings the alias table doesn't know about.
    let input_key = PlatformKey::new(&desc.name);
    let candidates = sqlx::query("SELECT id, name FROM platforms")
        .persistent(false)
        .fetch_all(&mut *conn)
        .await?;
    let mut best: Option<(i64, f64)> = None;
    for row in candidates {
        let cand_id: i64 = row.get("id");
        let cand_name: String = row.get("name");
        let cand_key = PlatformKey::new(&cand_name);
        if !input_key.numeric_compatible(&cand_key) {
            continue;
        }
        let sim = input_key.similarity(&cand_key);
        if sim >= MIN_PLATFORM_SIMILARITY && best.map_or(true, |(_, s)| sim > s) {
            best = Some((cand_id, sim));
        }
    }
    if let Some((id, _)) = best {
        return Ok(id);
    }

    let inserted = sqlx::query(
        "INSERT INTO platforms (code, name, family, canonical_code) VALUES ($1,$2,$3,$4)
         ON CONFLICT (canonical_code) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(&desc.code)
    .bind(&desc.name)
    .bind(desc.family)
    .bind(&canonical)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM platforms WHERE canonical_code=$1")
        .persistent(false)
        .bind(&canonical)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

#[instrument(skip(conn))]
pub async fn ensure_title(conn: &mut PgConnection, product_id: i64, title: &str) -> Result<i64> {
    let normalized = normalize_title(title);
    if let Some(rec) =
        sqlx::query("SELECT id FROM video_game_titles WHERE product_id=$1 AND normalized_title=$2")
            .persistent(false)
            .bind(product_id)
            .bind(&normalized)
            .fetch_optional(&mut *conn)
            .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO video_game_titles (product_id, title, normalized_title)
         VALUES ($1,$2,$3)
         ON CONFLICT (product_id, normalized_title) WHERE normalized_title <> ''
         DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(product_id)
    .bind(title)
    .bind(&normalized)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec =
        sqlx::query("SELECT id FROM video_game_titles WHERE product_id=$1 AND normalized_title=$2")
            .persistent(false)
            .bind(product_id)
            .bind(&normalized)
            .fetch_one(&mut *conn)
            .await?;
    Ok(rec.get("id"))
}

#[instrument(skip(conn))]
pub async fn ensure_video_game(
    conn: &mut PgConnection,
    title_id: i64,
    platform_id: i64,
    edition: Option<&str>,
) -> Result<i64> {
    let edition = edition.map(str::trim).filter(|e| !e.is_empty());
    if let Some(rec) = sqlx::query(
        "SELECT id FROM video_games
         WHERE title_id=$1 AND platform_id=$2 AND COALESCE(edition,'')=COALESCE($3,'')",
    )
    .persistent(false)
    .bind(title_id)
    .bind(platform_id)
    .bind(edition)
    .fetch_optional(&mut *conn)
    .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO video_games (title_id, platform_id, edition) VALUES ($1,$2,$3)
         ON CONFLICT (title_id, platform_id, COALESCE(edition,'')) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(title_id)
    .bind(platform_id)
    .bind(edition)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query(
        "SELECT id FROM video_games
         WHERE title_id=$1 AND platform_id=$2 AND COALESCE(edition,'')=COALESCE($3,'')",
    )
    .persistent(false)
    .bind(title_id)
    .bind(platform_id)
    .bind(edition)
    .fetch_one(&mut *conn)
    .await?;
    Ok(rec.get("id"))
}

pub async fn ensure_console(conn: &mut PgConnection, product_id: i64, name: &str) -> Result<i64> {
    if let Some(rec) = sqlx::query("SELECT id FROM consoles WHERE product_id=$1")
        .persistent(false)
        .bind(product_id)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO consoles (product_id, name) VALUES ($1,$2)
         ON CONFLICT (product_id) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(product_id)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM consoles WHERE product_id=$1")
        .persistent(false)
        .bind(product_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

pub async fn ensure_sellable_software(conn: &mut PgConnection, title_id: i64) -> Result<i64> {
    if let Some(rec) = sqlx::query("SELECT id FROM sellables WHERE software_title_id=$1")
        .persistent(false)
        .bind(title_id)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO sellables (software_title_id) VALUES ($1)
         ON CONFLICT (software_title_id) WHERE software_title_id IS NOT NULL
         DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(title_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM sellables WHERE software_title_id=$1")
        .persistent(false)
        .bind(title_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

pub async fn ensure_sellable_hardware(conn: &mut PgConnection, console_id: i64) -> Result<i64> {
    if let Some(rec) = sqlx::query("SELECT id FROM sellables WHERE console_id=$1")
        .persistent(false)
        .bind(console_id)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO sellables (console_id) VALUES ($1)
         ON CONFLICT (console_id) WHERE console_id IS NOT NULL
         DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(console_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM sellables WHERE console_id=$1")
        .persistent(false)
        .bind(console_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

pub async fn ensure_retailer(conn: &mut PgConnection, slug: &str, name: &str) -> Result<i64> {
    if let Some(rec) = sqlx::query("SELECT id FROM retailers WHERE slug=$1")
        .persistent(false)
        .bind(slug)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO retailers (slug, name) VALUES ($1,$2)
         ON CONFLICT (slug) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(slug)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query("SELECT id FROM retailers WHERE slug=$1")
        .persistent(false)
        .bind(slug)
        .fetch_one(&mut *conn)
        .await?;
    Ok(rec.get("id"))
}

#[instrument(skip(conn))]
pub async fn ensure_offer(
    conn: &mut PgConnection,
    sellable_id: i64,
    retailer_id: i64,
    sku: Option<&str>,
) -> Result<i64> {
    let sku = sku.map(str::trim).filter(|s| !s.is_empty());
    if let Some(rec) = sqlx::query(
        "SELECT id FROM offers
         WHERE sellable_id=$1 AND retailer_id=$2 AND COALESCE(sku,'')=COALESCE($3,'')",
    )
    .persistent(false)
    .bind(sellable_id)
    .bind(retailer_id)
    .bind(sku)
    .fetch_optional(&mut *conn)
    .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO offers (sellable_id, retailer_id, sku) VALUES ($1,$2,$3)
         ON CONFLICT (sellable_id, retailer_id, COALESCE(sku,'')) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(sellable_id)
    .bind(retailer_id)
    .bind(sku)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec = sqlx::query(
        "SELECT id FROM offers
         WHERE sellable_id=$1 AND retailer_id=$2 AND COALESCE(sku,'')=COALESCE($3,'')",
    )
    .persistent(false)
    .bind(sellable_id)
    .bind(retailer_id)
    .bind(sku)
    .fetch_one(&mut *conn)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip(conn))]
pub async fn ensure_offer_jurisdiction(
    conn: &mut PgConnection,
    offer_id: i64,
    jurisdiction_id: i64,
    currency_id: i64,
) -> Result<i64> {
    if let Some(rec) =
        sqlx::query("SELECT id FROM offer_jurisdictions WHERE offer_id=$1 AND jurisdiction_id=$2")
            .persistent(false)
            .bind(offer_id)
            .bind(jurisdiction_id)
            .fetch_optional(&mut *conn)
            .await?
    {
        return Ok(rec.get("id"));
    }
    let inserted = sqlx::query(
        "INSERT INTO offer_jurisdictions (offer_id, jurisdiction_id, currency_id)
         VALUES ($1,$2,$3)
         ON CONFLICT (offer_id, jurisdiction_id) DO NOTHING RETURNING id",
    )
    .persistent(false)
    .bind(offer_id)
    .bind(jurisdiction_id)
    .bind(currency_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }
    let rec =
        sqlx::query("SELECT id FROM offer_jurisdictions WHERE offer_id=$1 AND jurisdiction_id=$2")
            .persistent(false)
            .bind(offer_id)
            .bind(jurisdiction_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(rec.get("id"))
}

/// Recompute the trigger-maintained denormalizations from scratch. The
/// triggers are the canonical rule; this is the reconciliation path for
/// databases restored from partial dumps.
pub async fn reconcile_denormalized_counts(conn: &mut PgConnection) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE products p SET
            software_children_count = sub.sw,
            hardware_children_count = sub.hw
         FROM (
            SELECT pr.id,
                   (SELECT count(*)::int FROM video_game_titles t WHERE t.product_id = pr.id) AS sw,
                   (SELECT count(*)::int FROM consoles c WHERE c.product_id = pr.id) AS hw
            FROM products pr
         ) sub
         WHERE sub.id = p.id
           AND (p.software_children_count <> sub.sw OR p.hardware_children_count <> sub.hw)",
    )
    .persistent(false)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE video_game_titles t
         SET video_game_ids = COALESCE(
             (SELECT jsonb_agg(vg.id ORDER BY vg.id) FROM video_games vg WHERE vg.title_id = t.id),
             '[]'::jsonb)",
    )
    .persistent(false)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_unit_overrides() {
        for c in ["JPY", "KRW", "VND", "CLP", "ISK", "HUF"] {
            assert_eq!(currency_minor_unit(c), 0, "{c}");
        }
        for c in ["BHD", "IQD", "KWD", "JOD", "OMR", "TND"] {
            assert_eq!(currency_minor_unit(c), 3, "{c}");
        }
        assert_eq!(currency_minor_unit("USD"), 2);
        assert_eq!(currency_minor_unit("usd"), 2);
    }

    #[test]
    fn country_currency_defaults() {
        assert_eq!(currency_for_country("us").0, "USD");
        assert_eq!(currency_for_country("DE").0, "EUR");
        assert_eq!(currency_for_country("JP").0, "JPY");
    }

    #[test]
    fn iso3_known_and_unknown() {
        assert_eq!(iso3_from_iso2("us"), Some("USA"));
        assert_eq!(iso3_from_iso2("ZZ"), None);
    }
}
