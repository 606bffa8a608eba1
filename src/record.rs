//! Typed hotel/weather observations.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Column names of the fixed input schema and whether each holds a
/// string or a double.
pub const SCHEMA: [(&str, ColumnType); 11] = [
    ("address", ColumnType::Utf8),
    ("avg_tmpr_c", ColumnType::Double),
    ("avg_tmpr_f", ColumnType::Double),
    ("city", ColumnType::Utf8),
    ("country", ColumnType::Utf8),
    ("geoHash", ColumnType::Utf8),
    ("id", ColumnType::Utf8),
    ("latitude", ColumnType::Double),
    ("longitude", ColumnType::Double),
    ("name", ColumnType::Utf8),
    ("wthr_date", ColumnType::Utf8),
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Utf8,
    Double,
}

/// Aggregation grouping key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub city: String,
    pub wthr_date: String,
}

impl GroupKey {
    pub fn new(city: impl Into<String>, wthr_date: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            wthr_date: wthr_date.into(),
        }
    }
}

/// One decoded row. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: GroupKey,
    pub event_time: DateTime<Utc>,
    pub hotel_id: Option<String>,
    pub avg_tmpr_c: Option<f64>,
    pub avg_tmpr_f: Option<f64>,
    pub address: Option<String>,
    pub country: Option<String>,
    pub geo_hash: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub name: Option<String>,
}

impl Record {
    /// Record with just the fields the aggregation reads.
    pub fn observation(
        key: GroupKey,
        event_time: DateTime<Utc>,
        hotel_id: impl Into<String>,
        avg_tmpr_c: f64,
    ) -> Self {
        Self {
            key,
            event_time,
            hotel_id: Some(hotel_id.into()),
            avg_tmpr_c: Some(avg_tmpr_c),
            avg_tmpr_f: Some(avg_tmpr_c * 9.0 / 5.0 + 32.0),
            address: None,
            country: None,
            geo_hash: None,
            latitude: None,
            longitude: None,
            name: None,
        }
    }
}
