//! Schema-validating decoders from input files to [`Record`]s.
//!
//! The decoder is picked by file extension: `.parquet` files are read
//! through the `parquet` record API, `.json` / `.jsonl` files hold one
//! JSON object per line. Both must follow [`SCHEMA`].

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use chrono::DateTime;
use chrono::Utc;
use parquet::basic::Type as PhysicalType;
use parquet::file::reader::FileReader;
use parquet::file::reader::SerializedFileReader;
use parquet::record::Field;
use serde::Deserialize;

use serde_json::Map;
use serde_json::Value;

use crate::errors::DecodeError;
use crate::record::ColumnType;
use crate::record::GroupKey;
use crate::record::Record;
use crate::record::SCHEMA;

/// One row before the grouping key is checked.
#[derive(Debug, Default, Deserialize)]
struct RawRow {
    address: Option<String>,
    avg_tmpr_c: Option<f64>,
    avg_tmpr_f: Option<f64>,
    city: Option<String>,
    country: Option<String>,
    #[serde(rename = "geoHash")]
    geo_hash: Option<String>,
    id: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    name: Option<String>,
    wthr_date: Option<String>,
}

impl RawRow {
    /// `None` if either half of the grouping key is null.
    fn into_record(self, event_time: DateTime<Utc>) -> Option<Record> {
        let (Some(city), Some(wthr_date)) = (self.city, self.wthr_date) else {
            return None;
        };
        Some(Record {
            key: GroupKey::new(city, wthr_date),
            event_time,
            hotel_id: self.id,
            avg_tmpr_c: self.avg_tmpr_c,
            avg_tmpr_f: self.avg_tmpr_f,
            address: self.address,
            country: self.country,
            geo_hash: self.geo_hash,
            latitude: self.latitude,
            longitude: self.longitude,
            name: self.name,
        })
    }
}

/// Decode every row of one file, stamping each with `event_time`.
///
/// Rows with a null `city` or `wthr_date` are dropped with a warning;
/// any other problem fails the whole file.
pub fn decode_file(path: &Path, event_time: DateTime<Utc>) -> Result<Vec<Record>, DecodeError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());
    let rows = match extension.as_deref() {
        Some("parquet") => decode_parquet(path)?,
        Some("json") | Some("jsonl") => decode_json_lines(path)?,
        other => {
            return Err(DecodeError::new(
                path,
                format!("unsupported file extension {other:?}"),
            ))
        }
    };

    let total = rows.len();
    let records: Vec<Record> = rows
        .into_iter()
        .filter_map(|row| row.into_record(event_time))
        .collect();
    if records.len() < total {
        tracing::warn!(
            "Dropped {} rows of {path:?} with a null city or wthr_date",
            total - records.len()
        );
    }
    Ok(records)
}

fn decode_json_lines(path: &Path) -> Result<Vec<RawRow>, DecodeError> {
    let file = File::open(path).map_err(|err| DecodeError::new(path, err))?;
    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|err| DecodeError::new(path, err))?;
        if line.trim().is_empty() {
            continue;
        }
        let line_err =
            |reason: String| DecodeError::new(path, format!("line {}: {reason}", line_no + 1));
        let object: Map<String, Value> =
            serde_json::from_str(&line).map_err(|err| line_err(err.to_string()))?;
        // Columns may be null but never absent.
        let missing = SCHEMA
            .iter()
            .find(|(name, _column_type)| !object.contains_key(*name));
        if let Some((name, _column_type)) = missing {
            return Err(line_err(format!("missing column {name:?}")));
        }
        let row = serde_json::from_value(Value::Object(object))
            .map_err(|err| line_err(err.to_string()))?;
        rows.push(row);
    }
    Ok(rows)
}

fn decode_parquet(path: &Path) -> Result<Vec<RawRow>, DecodeError> {
    let file = File::open(path).map_err(|err| DecodeError::new(path, err))?;
    let reader = SerializedFileReader::new(file).map_err(|err| DecodeError::new(path, err))?;

    let descr = reader.metadata().file_metadata().schema_descr();
    for (name, column_type) in SCHEMA {
        let column = descr
            .columns()
            .iter()
            .find(|column| column.name() == name)
            .ok_or_else(|| DecodeError::new(path, format!("missing column {name:?}")))?;
        let physical_type = column.physical_type();
        let matches = match column_type {
            ColumnType::Utf8 => physical_type == PhysicalType::BYTE_ARRAY,
            ColumnType::Double => {
                matches!(physical_type, PhysicalType::DOUBLE | PhysicalType::FLOAT)
            }
        };
        if !matches {
            return Err(DecodeError::new(
                path,
                format!("column {name:?} has type {physical_type}, expected {column_type:?}"),
            ));
        }
    }

    let mut rows = Vec::new();
    let iter = reader
        .get_row_iter(None)
        .map_err(|err| DecodeError::new(path, err))?;
    for row in iter {
        let row = row.map_err(|err| DecodeError::new(path, err))?;
        let mut raw = RawRow::default();
        for (name, field) in row.get_column_iter() {
            let res = match name.as_str() {
                "address" => string_field(field).map(|v| raw.address = v),
                "avg_tmpr_c" => double_field(field).map(|v| raw.avg_tmpr_c = v),
                "avg_tmpr_f" => double_field(field).map(|v| raw.avg_tmpr_f = v),
                "city" => string_field(field).map(|v| raw.city = v),
                "country" => string_field(field).map(|v| raw.country = v),
                "geoHash" => string_field(field).map(|v| raw.geo_hash = v),
                "id" => string_field(field).map(|v| raw.id = v),
                "latitude" => double_field(field).map(|v| raw.latitude = v),
                "longitude" => double_field(field).map(|v| raw.longitude = v),
                "name" => string_field(field).map(|v| raw.name = v),
                "wthr_date" => string_field(field).map(|v| raw.wthr_date = v),
                // Extra columns are ignored.
                _ => Ok(()),
            };
            res.map_err(|reason| DecodeError::new(path, format!("column {name:?}: {reason}")))?;
        }
        rows.push(raw);
    }
    Ok(rows)
}

fn string_field(field: &Field) -> Result<Option<String>, String> {
    match field {
        Field::Null => Ok(None),
        Field::Str(value) => Ok(Some(value.clone())),
        Field::Bytes(value) => value
            .as_utf8()
            .map(|value| Some(value.to_string()))
            .map_err(|err| err.to_string()),
        other => Err(format!("expected a string, got {other}")),
    }
}

fn double_field(field: &Field) -> Result<Option<f64>, String> {
    match field {
        Field::Null => Ok(None),
        Field::Double(value) => Ok(Some(*value)),
        Field::Float(value) => Ok(Some(*value as f64)),
        other => Err(format!("expected a double, got {other}")),
    }
}
