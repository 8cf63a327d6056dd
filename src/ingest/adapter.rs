//! The inbound plug-in contract. Each upstream (Steam, itch.io, Epic,
//! Giant Bomb, ...) implements [`SourceAdapter`] and yields provider-scoped
//! raw records; everything downstream of the trait is vendor-agnostic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Storefront,
    Catalog,
    Media,
    Aggregator,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Storefront => "storefront",
            SourceKind::Catalog => "catalog",
            SourceKind::Media => "media",
            SourceKind::Aggregator => "aggregator",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceIdentity {
    pub provider_key: String,
    pub slug: String,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Catalog,
    Price,
    Media,
}

/// One media asset carried by a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub url: String,
    pub media_type: String,
    #[serde(default)]
    pub stream_url: Option<String>,
    #[serde(default)]
    pub width: Option<i32>,
    #[serde(default)]
    pub height: Option<i32>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub provider_data: Value,
}

/// A provider-scoped raw record. `external_id` is unique within the
/// provider; the hints drive lazy canonical-entity creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub external_id: String,
    pub kind: RecordKind,
    #[serde(default)]
    pub product_hint: Option<String>,
    #[serde(default)]
    pub title_hint: Option<String>,
    #[serde(default)]
    pub platform_hint: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    /// "US" or "US-CA" style jurisdiction spec.
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub amount_minor: Option<i64>,
    #[serde(default)]
    pub tax_inclusive: bool,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

impl RawRecord {
    /// Split the region spec into (country, sub-region).
    pub fn region_parts(&self) -> (Option<&str>, Option<&str>) {
        match self.region.as_deref() {
            None => (None, None),
            Some(r) => {
                let mut it = r.splitn(2, '-');
                let country = it.next().filter(|c| !c.is_empty());
                (country, it.next().filter(|s| !s.is_empty()))
            }
        }
    }
}

pub type RecordStream = BoxStream<'static, Result<RawRecord, IngestError>>;

/// Implemented per upstream. `fetch` may be called once per region; the
/// cursor round-trips through the source registry between runs.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> SourceIdentity;

    async fn fetch(
        &self,
        cursor: Option<String>,
        region: Option<String>,
    ) -> Result<RecordStream, IngestError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn region_parts_split_country_and_subregion() {
        let mut rec: RawRecord = serde_json::from_value(json!({
            "external_id": "app:620",
            "kind": "price",
            "recorded_at": "2026-01-15T10:00:00Z",
            "region": "US-CA"
        }))
        .unwrap();
        assert_eq!(rec.region_parts(), (Some("US"), Some("CA")));
        rec.region = Some("US".into());
        assert_eq!(rec.region_parts(), (Some("US"), None));
        rec.region = None;
        assert_eq!(rec.region_parts(), (None, None));
    }

    #[test]
    fn raw_record_deserializes_with_defaults() {
        let rec: RawRecord = serde_json::from_value(json!({
            "external_id": "app:620",
            "kind": "catalog",
            "title_hint": "Portal 2",
            "platform_hint": "pc",
            "recorded_at": "2026-01-15T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(rec.kind, RecordKind::Catalog);
        assert!(rec.media.is_empty());
        assert!(!rec.tax_inclusive);
        assert!(rec.attributes.is_null());
    }

    #[test]
    fn source_kind_round_trips_lowercase() {
        assert_eq!(SourceKind::Storefront.as_str(), "storefront");
        let k: SourceKind = serde_json::from_value(json!("aggregator")).unwrap();
        assert_eq!(k, SourceKind::Aggregator);
    }
}
