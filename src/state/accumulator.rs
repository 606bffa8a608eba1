use serde::Deserialize;
use serde::Serialize;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::outputs::StatRow;
use crate::record::GroupKey;
use crate::record::Record;
use crate::window::Window;

use super::sketch::HyperLogLog;

/// Running count / sum / min / max of one nullable column.
///
/// `count + nulls` is the number of records folded in. NaN and
/// infinite values count as nulls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: u64,
    pub nulls: u64,
    /// Finite values can still overflow to infinity, which JSON has no
    /// number for, so snapshots keep the raw bits.
    #[serde(with = "f64_bits")]
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl FieldStats {
    fn add(&mut self, value: Option<f64>) {
        match value.filter(|value| value.is_finite()) {
            Some(value) => {
                self.count += 1;
                self.sum += value;
                self.min = Some(self.min.map_or(value, |min| min.min(value)));
                self.max = Some(self.max.map_or(value, |max| max.max(value)));
            }
            None => self.nulls += 1,
        }
    }

    fn merge(&mut self, other: &FieldStats) {
        self.count += other.count;
        self.nulls += other.nulls;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(ours), Some(theirs)) => Some(ours.min(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
        self.max = match (self.max, other.max) {
            (Some(ours), Some(theirs)) => Some(ours.max(theirs)),
            (ours, theirs) => ours.or(theirs),
        };
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    fn check(&self, records: u64, name: &str) -> Result<(), String> {
        if self.count + self.nulls != records {
            return Err(format!(
                "{name} counts {} + {} nulls but {records} records were merged",
                self.count, self.nulls
            ));
        }
        let has_extrema = self.min.is_some() && self.max.is_some();
        if has_extrema != (self.count > 0) {
            return Err(format!(
                "{name} has {} values but min/max {:?}/{:?}",
                self.count, self.min, self.max
            ));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(format!("{name} min {min} is above max {max}"));
            }
        }
        Ok(())
    }
}

mod f64_bits {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

/// Mergeable partial aggregate for one `(window, group key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    /// Admitted records merged in.
    pub records: u64,
    pub distinct_hotels: HyperLogLog,
    pub celsius: FieldStats,
    pub fahrenheit: FieldStats,
}

impl Accumulator {
    pub fn new(precision: u8) -> Self {
        Self {
            records: 0,
            distinct_hotels: HyperLogLog::new(precision),
            celsius: FieldStats::default(),
            fahrenheit: FieldStats::default(),
        }
    }

    /// Accumulator holding a single record.
    pub fn of(precision: u8, record: &Record) -> Self {
        let mut acc = Self::new(precision);
        acc.records = 1;
        if let Some(hotel_id) = &record.hotel_id {
            acc.distinct_hotels.insert(hotel_id);
        }
        acc.celsius.add(record.avg_tmpr_c);
        acc.fahrenheit.add(record.avg_tmpr_f);
        acc
    }

    /// Combine in place. Associative and commutative.
    pub fn merge(&mut self, other: &Accumulator) -> PipelineResult<()> {
        self.distinct_hotels.merge(&other.distinct_hotels)?;
        self.records += other.records;
        self.celsius.merge(&other.celsius);
        self.fahrenheit.merge(&other.fahrenheit);
        Ok(())
    }

    /// Check the internal consistency of counters.
    pub fn validate(&self) -> PipelineResult<()> {
        self.celsius
            .check(self.records, "avg_tmpr_c")
            .and_then(|_| self.fahrenheit.check(self.records, "avg_tmpr_f"))
            .map_err(PipelineError::StoreCorruption)
    }

    pub fn distinct_hotel_count(&self) -> u64 {
        self.distinct_hotels.estimate()
    }

    pub fn to_row(&self, window: &Window, key: &GroupKey) -> StatRow {
        StatRow {
            window_start: window.start,
            window_end: window.end,
            city: key.city.clone(),
            wthr_date: key.wthr_date.clone(),
            distinct_hotel_count: self.distinct_hotel_count(),
            avg_avg_tmpr_c: self.celsius.avg(),
            max_avg_tmpr_c: self.celsius.max,
            min_avg_tmpr_c: self.celsius.min,
            avg_avg_tmpr_f: self.fahrenheit.avg(),
            max_avg_tmpr_f: self.fahrenheit.max,
            min_avg_tmpr_f: self.fahrenheit.min,
            records: self.records,
        }
    }
}
