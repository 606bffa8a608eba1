use chrono::prelude::*;
use chrono::Duration;

use crate::record::Record;

use super::Watermark;
use super::Window;
use super::Windower;

/// Result of observing one batch of records.
#[derive(Debug, Default)]
pub struct Observed {
    /// Admitted records paired with every assigned window that is
    /// still open.
    pub admitted: Vec<(Record, Vec<Window>)>,
    /// Records late for all of their windows. Counted, never merged.
    pub late: Vec<Record>,
    /// Watermark after this batch.
    pub watermark: Watermark,
}

/// Uses event times from records as the clock.
///
/// The watermark is the maximum event time seen minus the lateness
/// bound. It never goes backwards.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    lateness: Duration,
    watermark: Watermark,
}

impl WatermarkTracker {
    pub fn new(lateness: Duration, resume_from: Watermark) -> Self {
        Self {
            lateness,
            watermark: resume_from,
        }
    }

    pub fn lateness(&self) -> Duration {
        self.lateness
    }

    pub fn current_watermark(&self) -> Watermark {
        self.watermark
    }

    /// Advance the watermark from a batch's maximum event time.
    pub fn advance(&mut self, records: &[Record]) -> Watermark {
        let candidate = records
            .iter()
            .map(|record| record.event_time)
            .max()
            .and_then(|max_time| max_time.checked_sub_signed(self.lateness))
            .map(Watermark::at)
            .unwrap_or(Watermark::MIN);
        self.watermark = self.watermark.max(candidate);
        self.watermark
    }

    /// Advance the watermark, then split the batch into admitted and
    /// late records.
    ///
    /// The watermark is updated before partitioning, so a record can't
    /// be late relative to its own batch's maximum event time.
    pub fn observe(&mut self, records: Vec<Record>, windower: &dyn Windower) -> Observed {
        let watermark = self.advance(&records);

        let mut observed = Observed {
            watermark,
            ..Default::default()
        };
        for record in records {
            let windows = windower.intersects(&record.event_time);
            let admitted = windows
                .iter()
                .any(|window| is_on_time(window, &watermark));
            if admitted {
                let open = windows
                    .into_iter()
                    .filter(|window| !window.is_closed(self.lateness, &watermark))
                    .collect();
                observed.admitted.push((record, open));
            } else {
                tracing::trace!(
                    "{:?} at {:?} late for watermark {watermark}",
                    record.key,
                    record.event_time
                );
                observed.late.push(record);
            }
        }
        observed
    }
}

fn is_on_time(window: &Window, watermark: &Watermark) -> bool {
    match watermark.as_datetime() {
        Some(watermark) => window.end >= watermark,
        None => true,
    }
}
