//! Internal code for output.
//!
//! Architecture
//! ------------
//!
//! Output is based around the core trait of [`Sink`]. The scheduler
//! hands every batch's emitted rows to a [`SinkSet`], which delegates
//! to impls of that trait for actual writing.
//!
//! Every sink must tolerate re-delivery: after a crash between the
//! sink write and the checkpoint write the same rows are written
//! again with the same values. Sinks keyed by [`RowKey`] just
//! overwrite.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::PipelineResult;
use crate::record::GroupKey;
use crate::window::Window;

pub(crate) mod memory_output;
pub(crate) mod sqlite_output;
pub(crate) mod std_output;

pub use self::memory_output::MemorySink;
pub use self::sqlite_output::SqliteTableSink;
pub use self::std_output::StdOutput;

/// Upsert key of an output row.
pub type RowKey = (Window, GroupKey);

/// One aggregated row, as published to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub city: String,
    pub wthr_date: String,
    pub distinct_hotel_count: u64,
    pub avg_avg_tmpr_c: Option<f64>,
    pub max_avg_tmpr_c: Option<f64>,
    pub min_avg_tmpr_c: Option<f64>,
    pub avg_avg_tmpr_f: Option<f64>,
    pub max_avg_tmpr_f: Option<f64>,
    pub min_avg_tmpr_f: Option<f64>,
    /// Admitted records aggregated into this row.
    pub records: u64,
}

impl StatRow {
    pub fn key(&self) -> RowKey {
        (
            Window::new(self.window_start, self.window_end),
            GroupKey::new(self.city.clone(), self.wthr_date.clone()),
        )
    }
}

/// Where emitted rows go.
pub trait Sink: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Durably (as far as this sink is durable) write all rows of one
    /// batch. Either everything is written or an error is returned.
    fn write_batch(&mut self, epoch: u64, rows: &[StatRow]) -> PipelineResult<()>;
}

/// Fans each batch out to every configured sink, in order.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Sink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// The first failing sink aborts the batch.
    pub fn write_batch(&mut self, epoch: u64, rows: &[StatRow]) -> PipelineResult<()> {
        for sink in self.sinks.iter_mut() {
            tracing::debug!("Writing {} rows of epoch {epoch} to {}", rows.len(), sink.name());
            sink.write_batch(epoch, rows)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sinks.iter().map(|sink| sink.name()))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::errors::PipelineError;

    pub(crate) fn row(city: &str, minute: u32, distinct: u64) -> StatRow {
        StatRow {
            window_start: Utc.with_ymd_and_hms(2021, 1, 1, 12, minute, 0).unwrap(),
            window_end: Utc.with_ymd_and_hms(2021, 1, 1, 12, minute + 2, 0).unwrap(),
            city: city.to_string(),
            wthr_date: "2021-01-01".to_string(),
            distinct_hotel_count: distinct,
            avg_avg_tmpr_c: Some(12.0),
            max_avg_tmpr_c: Some(14.0),
            min_avg_tmpr_c: Some(10.0),
            avg_avg_tmpr_f: Some(53.6),
            max_avg_tmpr_f: Some(57.2),
            min_avg_tmpr_f: Some(50.0),
            records: 3,
        }
    }

    struct FailingSink;

    impl Sink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn write_batch(&mut self, _epoch: u64, _rows: &[StatRow]) -> PipelineResult<()> {
            Err(PipelineError::SinkWriteFailure("unplugged".into()))
        }
    }

    #[test]
    fn sink_set_stops_at_first_failure() {
        let before = MemorySink::new();
        let after = MemorySink::new();
        let mut sinks = SinkSet::new()
            .with(before.clone())
            .with(FailingSink)
            .with(after.clone());

        let res = sinks.write_batch(1, &[row("Kyiv", 0, 2)]);
        assert!(matches!(res, Err(PipelineError::SinkWriteFailure(_))));
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 0);
    }
}
