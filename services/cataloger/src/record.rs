//! Catalog record data model.
//!
//! A [`CatalogRecord`] only exists in a terminal state. Its [`RecordOutcome`]
//! ties the metadata to `processed` records and the TTL to `error` records,
//! and the persisted JSON shape is produced through [`RecordDocument`].

use crate::locator::ImageLocator;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Placeholder stored for every scalar field the vision service left out
pub const UNKNOWN: &str = "N/D";

/// Terminal status of a catalog record. `pending` is never stored: it is
/// the absence of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Processed,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Processed => "processed",
            RecordStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processed" => Some(RecordStatus::Processed),
            "error" => Some(RecordStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Original (US) edition of a translated comic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalUsInfo {
    pub title: String,
    pub publisher: String,
    pub year: String,
}

/// Normalized catalog fields. Every field is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComicMetadata {
    pub title: String,
    pub issue_number: String,
    pub publish_date: String,
    pub plot: String,
    pub cover_url: String,
    pub publisher: String,
    pub format_type: String,
    pub writers: Vec<String>,
    pub artists: Vec<String>,
    pub colorists: Vec<String>,
    pub letterers: Vec<String>,
    pub editors: Vec<String>,
    pub cover_artists: Vec<String>,
    pub characters: Vec<String>,
    pub teams: Vec<String>,
    pub locations: Vec<String>,
    pub genres: Vec<String>,
    pub rating: String,
    pub original_us_info: OriginalUsInfo,
}

impl ComicMetadata {
    /// Map a raw vision payload onto the catalog shape, substituting
    /// [`UNKNOWN`] for missing scalars and an empty list for missing lists.
    pub fn normalize(raw: &Value) -> Self {
        let original = raw.get("original_us_info").unwrap_or(&Value::Null);

        Self {
            title: scalar(raw, &["title", "series_name"]),
            issue_number: scalar(raw, &["issue_number"]),
            publish_date: scalar(raw, &["publish_date", "publication_year"]),
            plot: scalar(raw, &["plot"]),
            cover_url: scalar(raw, &["cover_url"]),
            publisher: scalar(raw, &["publisher"]),
            format_type: scalar(raw, &["format_type"]),
            writers: list(raw, "writers"),
            artists: list(raw, "artists"),
            colorists: list(raw, "colorists"),
            letterers: list(raw, "letterers"),
            editors: list(raw, "editors"),
            cover_artists: list(raw, "cover_artists"),
            characters: list(raw, "characters"),
            teams: list(raw, "teams"),
            locations: list(raw, "locations"),
            genres: list(raw, "genres"),
            rating: scalar(raw, &["rating"]),
            original_us_info: OriginalUsInfo {
                title: scalar(original, &["title"]),
                publisher: scalar(original, &["publisher"]),
                year: scalar(original, &["year"]),
            },
        }
    }
}

/// First usable value among `keys`, rendered as text
fn scalar(raw: &Value, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find_map(text)
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn list(raw: &Value, key: &str) -> Vec<String> {
    match raw.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(text).collect(),
        Some(single) => text(single).into_iter().collect(),
        None => Vec::new(),
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// What ingestion concluded about an image
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Processed { metadata: ComicMetadata },
    /// Short-lived record; the document store expires it after `ttl_secs`
    Error { ttl_secs: u32 },
}

/// The canonical catalog entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RecordDocument", try_from = "RecordDocument")]
pub struct CatalogRecord {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub original_image_url: String,
    pub ai_analysis: Option<Value>,
    pub upload_timestamp: DateTime<Utc>,
    pub outcome: RecordOutcome,
}

impl CatalogRecord {
    pub fn processed(
        locator: &ImageLocator,
        ai_analysis: Value,
        metadata: ComicMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: locator.record_id(),
            user_id: locator.owner().map(str::to_string),
            original_image_url: locator.as_str().to_string(),
            ai_analysis: Some(ai_analysis),
            upload_timestamp: now,
            outcome: RecordOutcome::Processed { metadata },
        }
    }

    pub fn failed(
        locator: &ImageLocator,
        ai_analysis: Option<Value>,
        ttl_secs: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: locator.record_id(),
            user_id: locator.owner().map(str::to_string),
            original_image_url: locator.as_str().to_string(),
            ai_analysis,
            upload_timestamp: now,
            outcome: RecordOutcome::Error { ttl_secs },
        }
    }

    pub fn status(&self) -> RecordStatus {
        match self.outcome {
            RecordOutcome::Processed { .. } => RecordStatus::Processed,
            RecordOutcome::Error { .. } => RecordStatus::Error,
        }
    }

    pub fn metadata(&self) -> Option<&ComicMetadata> {
        match &self.outcome {
            RecordOutcome::Processed { metadata } => Some(metadata),
            RecordOutcome::Error { .. } => None,
        }
    }

    pub fn ttl_secs(&self) -> Option<u32> {
        match self.outcome {
            RecordOutcome::Error { ttl_secs } => Some(ttl_secs),
            RecordOutcome::Processed { .. } => None,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_secs()
            .map(|ttl| self.upload_timestamp + Duration::seconds(i64::from(ttl)))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Unowned legacy records are visible to everyone
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        self.user_id.as_deref().map_or(true, |owner| owner == user_id)
    }
}

/// Persisted JSON shape shared by the document store and the search index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDocument {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub original_image_url: String,
    #[serde(default)]
    pub ai_analysis: Option<Value>,
    pub status: RecordStatus,
    pub upload_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<ComicMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

impl From<CatalogRecord> for RecordDocument {
    fn from(record: CatalogRecord) -> Self {
        let status = record.status();
        let (metadata, ttl) = match record.outcome {
            RecordOutcome::Processed { metadata } => (Some(metadata), None),
            RecordOutcome::Error { ttl_secs } => (None, Some(ttl_secs)),
        };

        Self {
            id: record.id,
            user_id: record.user_id,
            original_image_url: record.original_image_url,
            ai_analysis: record.ai_analysis,
            status,
            upload_timestamp: record.upload_timestamp,
            metadata,
            ttl,
        }
    }
}

/// A stored document that breaks the status/metadata/ttl invariants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InconsistentRecord {
    pub id: Uuid,
    pub reason: &'static str,
}

impl fmt::Display for InconsistentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record {} is inconsistent: {}", self.id, self.reason)
    }
}

impl std::error::Error for InconsistentRecord {}

impl TryFrom<RecordDocument> for CatalogRecord {
    type Error = InconsistentRecord;

    fn try_from(doc: RecordDocument) -> Result<Self, Self::Error> {
        let outcome = match (doc.status, doc.metadata, doc.ttl) {
            (RecordStatus::Processed, Some(metadata), None) => {
                RecordOutcome::Processed { metadata }
            }
            (RecordStatus::Processed, None, _) => {
                return Err(InconsistentRecord {
                    id: doc.id,
                    reason: "processed record without metadata",
                })
            }
            (RecordStatus::Processed, Some(_), Some(_)) => {
                return Err(InconsistentRecord {
                    id: doc.id,
                    reason: "processed record with a ttl",
                })
            }
            (RecordStatus::Error, None, Some(ttl_secs)) => RecordOutcome::Error { ttl_secs },
            (RecordStatus::Error, Some(_), _) => {
                return Err(InconsistentRecord {
                    id: doc.id,
                    reason: "error record with metadata",
                })
            }
            (RecordStatus::Error, None, None) => {
                return Err(InconsistentRecord {
                    id: doc.id,
                    reason: "error record without a ttl",
                })
            }
        };

        Ok(Self {
            id: doc.id,
            user_id: doc.user_id,
            original_image_url: doc.original_image_url,
            ai_analysis: doc.ai_analysis,
            upload_timestamp: doc.upload_timestamp,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn locator() -> ImageLocator {
        ImageLocator::parse("https://store/uploads/user42/abc.jpg").unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_normalize_fills_every_missing_field() {
        let metadata = ComicMetadata::normalize(&json!({ "title": "Amazing Spider-Man #1" }));

        assert_eq!(metadata.title, "Amazing Spider-Man #1");
        assert_eq!(metadata.issue_number, UNKNOWN);
        assert_eq!(metadata.publisher, UNKNOWN);
        assert_eq!(metadata.rating, UNKNOWN);
        assert!(metadata.writers.is_empty());
        assert_eq!(metadata.original_us_info.year, UNKNOWN);
    }

    #[test]
    fn test_normalize_coerces_loose_ai_values() {
        let metadata = ComicMetadata::normalize(&json!({
            "series_name": "Dylan Dog",
            "issue_number": 150,
            "publication_year": "1999",
            "writers": "Tiziano Sclavi",
            "artists": ["Angelo Stano", "", null, 7],
            "genres": null,
            "plot": "   ",
            "original_us_info": { "title": "Dylan Dog", "year": 1986 }
        }));

        assert_eq!(metadata.title, "Dylan Dog");
        assert_eq!(metadata.issue_number, "150");
        assert_eq!(metadata.publish_date, "1999");
        assert_eq!(metadata.writers, vec!["Tiziano Sclavi"]);
        assert_eq!(metadata.artists, vec!["Angelo Stano", "7"]);
        assert!(metadata.genres.is_empty());
        assert_eq!(metadata.plot, UNKNOWN);
        assert_eq!(metadata.original_us_info.year, "1986");
        assert_eq!(metadata.original_us_info.publisher, UNKNOWN);
    }

    #[test]
    fn test_processed_record_shape() {
        let raw = json!({ "title": "Watchmen" });
        let record = CatalogRecord::processed(&locator(), raw.clone(), ComicMetadata::normalize(&raw), at());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["user_id"], "user42");
        assert_eq!(json["status"], "processed");
        assert_eq!(json["metadata"]["title"], "Watchmen");
        assert_eq!(json["ai_analysis"], raw);
        assert!(json.get("ttl").is_none());
        assert_eq!(record.expires_at(), None);
    }

    #[test]
    fn test_error_record_shape() {
        let record = CatalogRecord::failed(&locator(), None, 60, at());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["status"], "error");
        assert_eq!(json["ttl"], 60);
        assert!(json["metadata"].is_null());
        assert!(json["ai_analysis"].is_null());
        assert_eq!(record.expires_at(), Some(at() + Duration::seconds(60)));
        assert!(!record.is_expired(at()));
        assert!(record.is_expired(at() + Duration::seconds(60)));
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_documents() {
        let processed_without_metadata = json!({
            "id": Uuid::nil(),
            "original_image_url": "https://store/uploads/a.jpg",
            "status": "processed",
            "upload_timestamp": "2024-03-01T12:00:00Z",
            "metadata": null
        });
        let err = serde_json::from_value::<CatalogRecord>(processed_without_metadata).unwrap_err();
        assert!(err.to_string().contains("without metadata"));

        let error_without_ttl = json!({
            "id": Uuid::nil(),
            "original_image_url": "https://store/uploads/a.jpg",
            "status": "error",
            "upload_timestamp": "2024-03-01T12:00:00Z"
        });
        assert!(serde_json::from_value::<CatalogRecord>(error_without_ttl).is_err());
    }

    #[test]
    fn test_legacy_record_is_visible_to_everyone() {
        let legacy = ImageLocator::parse("https://store/uploads/old.jpg").unwrap();
        let record = CatalogRecord::failed(&legacy, None, 60, at());

        assert_eq!(record.user_id, None);
        assert!(record.is_visible_to("anyone"));

        let owned = CatalogRecord::failed(&locator(), None, 60, at());
        assert!(owned.is_visible_to("user42"));
        assert!(!owned.is_visible_to("user7"));
    }
}
