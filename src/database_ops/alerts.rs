//! Alert evaluation over the current-price projection. Delivery (email,
//! discord) is a consumer; this layer only decides which alerts fire and
//! stamps last_triggered_at to prevent flapping.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use crate::database_ops::db::Db;
use crate::database_ops::exchange::{btc_sats_for_amount, ExchangeService};

/// Minimum gap between firings of the same alert.
pub const ALERT_COOLDOWN_HOURS: i64 = 24;

#[derive(Debug)]
pub struct AlertTrigger {
    pub alert_id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub offer_jurisdiction_id: i64,
    pub channel: String,
    pub threshold_sats: i64,
    pub current_sats: i64,
    pub triggered_at: DateTime<Utc>,
}

/// True when `current` crosses `threshold` in the alert's direction.
pub fn threshold_crossed(op: &str, current_sats: i64, threshold_sats: i64) -> bool {
    match op {
        "below" => current_sats < threshold_sats,
        "above" => current_sats > threshold_sats,
        _ => false,
    }
}

/// Evaluate active alerts against the current prices of the given offer
/// jurisdictions. Prices are compared in satoshis using the latest
/// currency→BTC rate; rows without a rate are skipped.
#[instrument(skip(db, fx, offer_jurisdiction_ids))]
pub async fn evaluate_alerts(
    db: &Db,
    fx: &ExchangeService,
    offer_jurisdiction_ids: &[i64],
) -> Result<Vec<AlertTrigger>> {
    if offer_jurisdiction_ids.is_empty() {
        return Ok(vec![]);
    }

    let rows = sqlx::query(
        "SELECT a.id AS alert_id, a.user_id, a.product_id, a.region_code,
                a.threshold_btc, a.comparison_operator, a.channel,
                oj.id AS offer_jurisdiction_id,
                cp.amount_minor, cp.recorded_at,
                curr.code AS currency_code, curr.minor_unit
         FROM alerts a
         JOIN video_game_titles vgt ON vgt.product_id = a.product_id
         JOIN sellables s ON s.software_title_id = vgt.id
         JOIN offers o ON o.sellable_id = s.id
         JOIN offer_jurisdictions oj ON oj.offer_id = o.id
         JOIN jurisdictions j ON j.id = oj.jurisdiction_id
         JOIN countries co ON co.id = j.country_id
         JOIN currencies curr ON curr.id = oj.currency_id
         JOIN current_price cp ON cp.offer_jurisdiction_id = oj.id
         WHERE a.is_active
           AND oj.id = ANY($1)
           AND upper(COALESCE(j.region_code, co.iso2)) = upper(a.region_code)
           AND (a.last_triggered_at IS NULL
                OR a.last_triggered_at < now() - make_interval(hours => $2::int))",
    )
    .persistent(false)
    .bind(offer_jurisdiction_ids)
    .bind(ALERT_COOLDOWN_HOURS)
    .fetch_all(&db.pool)
    .await?;

    let mut triggers = Vec::new();
    for r in rows {
        let currency: String = r.get("currency_code");
        let rate = fx.latest_rate(&currency, "BTC").await?;
        let Some(current_sats) =
            btc_sats_for_amount(r.get("amount_minor"), r.get("minor_unit"), rate)
        else {
            continue;
        };
        let threshold_sats: i64 = r.get("threshold_btc");
        let op: String = r.get("comparison_operator");
        if !threshold_crossed(&op, current_sats, threshold_sats) {
            continue;
        }
        let alert_id: i64 = r.get("alert_id");
        sqlx::query("UPDATE alerts SET last_triggered_at = now() WHERE id = $1")
            .persistent(false)
            .bind(alert_id)
            .execute(&db.pool)
            .await?;
        triggers.push(AlertTrigger {
            alert_id,
            user_id: r.get("user_id"),
            product_id: r.get("product_id"),
            offer_jurisdiction_id: r.get("offer_jurisdiction_id"),
            channel: r.get("channel"),
            threshold_sats,
            current_sats,
            triggered_at: r.get("recorded_at"),
        });
    }
    Ok(triggers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_and_above_semantics() {
        assert!(threshold_crossed("below", 99, 100));
        assert!(!threshold_crossed("below", 100, 100));
        assert!(threshold_crossed("above", 101, 100));
        assert!(!threshold_crossed("above", 100, 100));
    }

    #[test]
    fn unknown_operator_never_fires() {
        assert!(!threshold_crossed("near", 1, 100));
    }
}
