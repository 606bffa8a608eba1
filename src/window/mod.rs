//! Internal code for windowing.
//!
//! Architecture
//! ------------
//!
//! Windowing is based around one trait and two value types:
//! [`Windower`], [`Window`] and [`Watermark`].
//!
//! A [`Windower`] is a pure function from an event time to the set of
//! windows containing it. [`sliding_window::SlidingWindower`] powers
//! the windowed aggregation; [`global_window::GlobalWindower`] puts
//! everything into one all-time window for the plain aggregation.
//!
//! The [`watermark::WatermarkTracker`] owns the single [`Watermark`]
//! of a query and uses a windower to decide which records of a batch
//! are admitted and which are late.
//!
//! A window is "closed" once `end + lateness_bound <= watermark`. The
//! state store evicts closed windows and never re-creates them,
//! because admission never hands a closed window to the store.

use std::fmt::Debug;

use chrono::prelude::*;
use chrono::Duration;
use serde::Deserialize;
use serde::Serialize;

use crate::config::Aggregation;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::errors::PipelineResult;

pub(crate) mod global_window;
pub(crate) mod sliding_window;
pub(crate) mod watermark;

pub use self::global_window::GlobalWindower;
pub use self::sliding_window::SlidingWindower;
pub use self::watermark::{Observed, WatermarkTracker};

/// Half-open time interval `[start, end)`.
///
/// Windows are derived from event times, never stored on their own;
/// two windows are the same window iff their bounds are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The single window of the plain aggregation.
    ///
    /// Bounds are millisecond-aligned so they survive a round trip
    /// through [`Window::to_millis`].
    pub fn global() -> Self {
        let start = DateTime::<Utc>::MIN_UTC.timestamp_millis();
        let end = DateTime::<Utc>::MAX_UTC.timestamp_millis();
        // Both bounds are in range by construction.
        Self::from_millis(start, end).unwrap_or(Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        })
    }

    pub fn to_millis(&self) -> (i64, i64) {
        (self.start.timestamp_millis(), self.end.timestamp_millis())
    }

    pub fn from_millis(start: i64, end: i64) -> Option<Self> {
        let start = Utc.timestamp_millis_opt(start).single()?;
        let end = Utc.timestamp_millis_opt(end).single()?;
        (start < end).then_some(Self { start, end })
    }

    pub fn contains(&self, time: &DateTime<Utc>) -> bool {
        self.start <= *time && *time < self.end
    }

    /// Has the watermark passed this window's end by at least the
    /// lateness bound?
    pub fn is_closed(&self, lateness: Duration, watermark: &Watermark) -> bool {
        match (watermark.as_datetime(), self.end.checked_add_signed(lateness)) {
            (Some(watermark), Some(close_at)) => close_at <= watermark,
            _ => false,
        }
    }
}

/// Lower bound on event time below which no more records are
/// expected.
///
/// [`Watermark::MIN`] represents `-inf`, the watermark before any
/// record has been seen. Ordering puts it before every instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(Option<DateTime<Utc>>);

impl Watermark {
    pub const MIN: Watermark = Watermark(None);

    pub fn at(time: DateTime<Utc>) -> Self {
        Self(Some(time))
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    pub fn to_millis(&self) -> Option<i64> {
        self.0.map(|time| time.timestamp_millis())
    }

    pub fn from_millis(millis: Option<i64>) -> Option<Self> {
        match millis {
            None => Some(Self::MIN),
            Some(millis) => Utc.timestamp_millis_opt(millis).single().map(Self::at),
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(time) => write!(f, "{}", time.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => f.write_str("-inf"),
        }
    }
}

/// Maps an event time to every window containing it.
pub trait Windower: Debug + Send {
    /// All windows containing `time`, ordered by start.
    fn intersects(&self, time: &DateTime<Utc>) -> Vec<Window>;
}

/// Build the windower for a validated configuration.
pub fn build_windower(config: &PipelineConfig) -> PipelineResult<Box<dyn Windower>> {
    match config.aggregation {
        Aggregation::Plain => Ok(Box::new(GlobalWindower)),
        Aggregation::Windowed => {
            let length = to_chrono(config.window_length)?;
            let slide = to_chrono(config.slide_interval)?;
            // Windows are aligned to the Unix epoch.
            let align_to = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
            Ok(Box::new(SlidingWindower::new(length, slide, align_to)?))
        }
    }
}

pub(crate) fn to_chrono(dur: std::time::Duration) -> PipelineResult<Duration> {
    Duration::from_std(dur)
        .map_err(|err| PipelineError::Config(format!("duration {dur:?} out of range: {err}")))
}
