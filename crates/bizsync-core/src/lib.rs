//! Core business model and provider-payload normalization for bizsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Category {
    pub alias: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Canonical business record handed from the normalizer to the store.
///
/// `external_id` is the provider-assigned identity; every other field is
/// replaced wholesale on each upsert.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub external_id: String,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub website: String,
    pub image_url: String,
    pub rating: f64,
    pub review_count: i64,
    pub coordinates: Option<Coordinates>,
    pub categories: Vec<Category>,
}

impl BusinessRecord {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A persisted business row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBusiness {
    /// Storage surrogate key. Only meaningful as a recency tie-breaker.
    pub row_id: i64,
    #[serde(flatten)]
    pub record: BusinessRecord,
    /// Number of successful writes this row has absorbed (1 after insert).
    pub ingest_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Business as returned by the search provider. Every field is optional so a
/// sparse or partially broken payload still deserializes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawBusiness {
    pub id: Option<String>,
    pub name: Option<String>,
    pub location: Option<RawLocation>,
    pub display_phone: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub categories: Option<Vec<RawCategory>>,
    pub coordinates: Option<RawCoordinates>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawLocation {
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub city: Option<String>,
    pub zip_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCategory {
    pub alias: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawCoordinates {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Convert a provider payload into a [`BusinessRecord`].
///
/// Only the provider id is mandatory; everything else falls back to an empty
/// string, zero, an empty list, or no coordinates.
pub fn normalize(raw: &RawBusiness) -> Result<BusinessRecord, NormalizeError> {
    let external_id = raw
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            NormalizeError::InvalidRecord(format!(
                "provider id is missing for business {:?}",
                raw.name.as_deref().unwrap_or("<unnamed>")
            ))
        })?;

    Ok(BusinessRecord {
        external_id: external_id.to_string(),
        name: raw.name.clone().unwrap_or_default(),
        address: format_address(raw.location.as_ref()),
        phone: raw.display_phone.clone().unwrap_or_default(),
        website: raw.url.clone().unwrap_or_default(),
        image_url: raw.image_url.clone().unwrap_or_default(),
        rating: raw.rating.unwrap_or(0.0),
        review_count: raw.review_count.unwrap_or(0),
        coordinates: raw.coordinates.and_then(|c| match (c.latitude, c.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates {
                latitude,
                longitude,
            }),
            _ => None,
        }),
        categories: raw
            .categories
            .iter()
            .flatten()
            .map(|c| Category {
                alias: c.alias.clone().unwrap_or_default(),
                title: c.title.clone().unwrap_or_default(),
            })
            .collect(),
    })
}

/// Normalize a batch, keeping input order so callers can report per-record failures.
pub fn normalize_batch(raws: &[RawBusiness]) -> Vec<Result<BusinessRecord, NormalizeError>> {
    raws.iter().map(normalize).collect()
}

/// Join the non-empty location parts in street, street 2, city, postal code, country order.
pub fn format_address(location: Option<&RawLocation>) -> String {
    let Some(location) = location else {
        return String::new();
    };
    [
        &location.address1,
        &location.address2,
        &location.city,
        &location.zip_code,
        &location.country,
    ]
    .into_iter()
    .filter_map(|part| part.as_deref())
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_id(id: &str) -> RawBusiness {
        RawBusiness {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn missing_or_blank_id_is_rejected() {
        assert!(matches!(
            normalize(&RawBusiness::default()),
            Err(NormalizeError::InvalidRecord(_))
        ));
        assert!(normalize(&raw_with_id("")).is_err());
        assert!(normalize(&raw_with_id("   ")).is_err());
    }

    #[test]
    fn optional_fields_fall_back_to_defaults() {
        let record = normalize(&raw_with_id("abc")).expect("normalize");
        assert_eq!(record, BusinessRecord::new("abc", ""));
        assert!(record.coordinates.is_none());
        assert!(record.categories.is_empty());
    }

    #[test]
    fn address_skips_empty_parts_in_fixed_order() {
        let location = RawLocation {
            address1: Some("1 Main St".into()),
            address2: Some(String::new()),
            city: Some("Paris".into()),
            zip_code: None,
            country: Some("FR".into()),
        };
        assert_eq!(format_address(Some(&location)), "1 Main St, Paris, FR");
        assert_eq!(format_address(Some(&RawLocation::default())), "");
        assert_eq!(format_address(None), "");
    }

    #[test]
    fn partial_coordinates_are_dropped() {
        let mut raw = raw_with_id("abc");
        raw.coordinates = Some(RawCoordinates {
            latitude: Some(48.85),
            longitude: None,
        });
        assert!(normalize(&raw).expect("normalize").coordinates.is_none());

        raw.coordinates = Some(RawCoordinates {
            latitude: Some(48.85),
            longitude: Some(2.35),
        });
        assert_eq!(
            normalize(&raw).expect("normalize").coordinates,
            Some(Coordinates {
                latitude: 48.85,
                longitude: 2.35
            })
        );
    }

    #[test]
    fn provider_json_maps_onto_record() {
        let raw: RawBusiness = serde_json::from_str(
            r#"{
                "id": "cafe-luna-paris",
                "name": "Cafe Luna",
                "display_phone": "+33 1 23 45 67 89",
                "url": "https://example.test/cafe-luna",
                "rating": 4.5,
                "review_count": 120,
                "is_closed": false,
                "location": {"address1": "1 Main St", "address2": null, "city": "Paris", "zip_code": "75001", "country": "FR"},
                "categories": [{"alias": "cafes", "title": "Cafes"}, {"title": "Bakeries"}],
                "coordinates": {"latitude": 48.86, "longitude": 2.34}
            }"#,
        )
        .expect("deserialize");

        let record = normalize(&raw).expect("normalize");
        assert_eq!(record.external_id, "cafe-luna-paris");
        assert_eq!(record.address, "1 Main St, Paris, 75001, FR");
        assert_eq!(record.phone, "+33 1 23 45 67 89");
        assert_eq!(record.website, "https://example.test/cafe-luna");
        assert_eq!(record.review_count, 120);
        assert_eq!(
            record.categories,
            vec![
                Category {
                    alias: "cafes".into(),
                    title: "Cafes".into()
                },
                Category {
                    alias: String::new(),
                    title: "Bakeries".into()
                },
            ]
        );
    }

    #[test]
    fn batch_keeps_input_order() {
        let results = normalize_batch(&[raw_with_id("a"), RawBusiness::default(), raw_with_id("b")]);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().map(|r| r.external_id.as_str()), Ok("a"));
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().map(|r| r.external_id.as_str()), Ok("b"));
    }
}
