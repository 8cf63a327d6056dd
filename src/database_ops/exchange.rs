//! Exchange-rate history access and the FX refresh path. Rates are
//! append-only; readers take the most recent row per (base, quote, any
//! provider) and fall back to the inverse pair.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::database_ops::db::Db;

#[derive(Clone)]
pub struct ExchangeService {
    pub db: Db,
    pub http: Client,
}

/// Rates document fetched from FX_PROVIDER_URL:
/// `{"provider": "...", "base": "BTC", "rates": {"USD": 43000.0, ...}}`.
#[derive(Debug, Deserialize)]
pub struct FxDocument {
    pub provider: String,
    pub base: String,
    pub rates: BTreeMap<String, f64>,
}

/// Satoshis for a fiat amount: `amount_minor / 10^minor_unit` major units,
/// times the currency→BTC rate, in 1e8ths. None when the rate is absent.
pub fn btc_sats_for_amount(amount_minor: i64, minor_unit: i16, rate_to_btc: Option<f64>) -> Option<i64> {
    let rate = rate_to_btc?;
    let scale = 10f64.powi(minor_unit.max(0) as i32);
    let major = amount_minor as f64 / scale;
    Some((major * rate * 1e8).round() as i64)
}

impl ExchangeService {
    pub fn new(db: Db, http_timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(http_timeout)
            .build()
            .expect("reqwest client");
        Self { db, http }
    }

    /// Most recent rate for base→quote across providers; falls back to the
    /// inverted reciprocal (rounded to 12 decimals) when only the reverse
    /// pair exists.
    pub async fn latest_rate(&self, base: &str, quote: &str) -> Result<Option<f64>> {
        let base = base.trim().to_ascii_uppercase();
        let quote = quote.trim().to_ascii_uppercase();
        if base.is_empty() || quote.is_empty() {
            return Ok(None);
        }
        if base == quote {
            return Ok(Some(1.0));
        }

        let direct: Option<f64> = sqlx::query_scalar(
            "SELECT rate FROM exchange_rates
             WHERE base_currency = $1 AND quote_currency = $2
             ORDER BY fetched_at DESC LIMIT 1",
        )
        .persistent(false)
        .bind(&base)
        .bind(&quote)
        .fetch_optional(&self.db.pool)
        .await?;
        if let Some(rate) = direct {
            return Ok(Some(rate));
        }

        let inverse: Option<f64> = sqlx::query_scalar(
            "SELECT rate FROM exchange_rates
             WHERE base_currency = $1 AND quote_currency = $2
             ORDER BY fetched_at DESC LIMIT 1",
        )
        .persistent(false)
        .bind(&quote)
        .bind(&base)
        .fetch_optional(&self.db.pool)
        .await?;
        let Some(inverse) = inverse else {
            return Ok(None);
        };
        if inverse == 0.0 {
            return Ok(None);
        }
        let v = 1.0 / inverse;
        Ok(Some((v * 1e12).round() / 1e12))
    }

    /// Fetch the configured rates document and append one history row per
    /// currency pair.
    #[instrument(skip(self))]
    pub async fn sync_rates(&self, provider_url: &str) -> Result<usize> {
        let doc: FxDocument = self
            .http
            .get(provider_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.store_document(&doc).await
    }

    pub async fn store_document(&self, doc: &FxDocument) -> Result<usize> {
        let base = doc.base.trim().to_ascii_uppercase();
        if base.is_empty() {
            return Err(anyhow!("fx document has empty base currency"));
        }
        let mut stored = 0usize;
        for (quote, rate) in &doc.rates {
            if *rate <= 0.0 {
                warn!(quote = %quote, rate, "skipping non-positive fx rate");
                continue;
            }
            sqlx::query(
                "INSERT INTO exchange_rates (base_currency, quote_currency, rate, provider)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (base_currency, quote_currency, provider, fetched_at) DO NOTHING",
            )
            .persistent(false)
            .bind(&base)
            .bind(quote.trim().to_ascii_uppercase())
            .bind(rate)
            .bind(&doc.provider)
            .execute(&self.db.pool)
            .await?;
            stored += 1;
        }
        info!(stored, base = %base, "stored exchange rates");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sats_for_two_decimal_currency() {
        // USD 9.99 at 0.0000231 BTC/USD = 23076.9 sats -> rounds to 23077.
        let sats = btc_sats_for_amount(999, 2, Some(0.0000231)).unwrap();
        assert_eq!(sats, 23077);
    }

    #[test]
    fn sats_for_zero_decimal_currency() {
        // JPY 1500 (minor == major) at 1e-8 BTC/JPY = 1500 sats.
        let sats = btc_sats_for_amount(1500, 0, Some(0.00000001)).unwrap();
        assert_eq!(sats, 1500);
    }

    #[test]
    fn missing_rate_yields_none() {
        assert_eq!(btc_sats_for_amount(999, 2, None), None);
    }

    #[test]
    fn free_price_is_zero_sats() {
        assert_eq!(btc_sats_for_amount(0, 2, Some(0.0001)), Some(0));
    }
}
