use chrono::prelude::*;
use chrono::Duration;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

use super::Window;
use super::Windower;

/// Sliding windows of fixed duration.
///
/// If slide == length, windows cover all time but do not
/// overlap. Each item will fall in exactly one window.
///
/// If slide < length, windows overlap. Each item will fall in
/// multiple windows.
///
/// If slide > length, there will be gaps between windows. Each item
/// can fall in up to one window, but might fall into none.
///
/// Window start times are inclusive, but end times are exclusive.
///
/// `align_to` is an instant that starts a window; every other window
/// start is a whole number of slides away from it.
#[derive(Debug, Clone)]
pub struct SlidingWindower {
    length: Duration,
    slide: Duration,
    align_to: DateTime<Utc>,
}

impl SlidingWindower {
    pub fn new(length: Duration, slide: Duration, align_to: DateTime<Utc>) -> PipelineResult<Self> {
        if length <= Duration::zero() || slide <= Duration::zero() {
            return Err(PipelineError::Config(format!(
                "window length ({length}) and slide ({slide}) must be positive"
            )));
        }
        Ok(Self {
            length,
            slide,
            align_to,
        })
    }

    /// Start of the window with the given index, if representable.
    fn window_open(&self, window_idx: i64) -> Option<DateTime<Utc>> {
        let offset = window_idx.checked_mul(self.slide.num_milliseconds())?;
        self.align_to
            .checked_add_signed(Duration::milliseconds(offset))
    }
}

impl Windower for SlidingWindower {
    fn intersects(&self, time: &DateTime<Utc>) -> Vec<Window> {
        let since_close_of_first_window = *time - (self.align_to + self.length);
        // Index of the first window whose exclusive close is after
        // `time`. Always round towards -inf.
        let first_window_idx = since_close_of_first_window
            .num_milliseconds()
            .div_euclid(self.slide.num_milliseconds())
            + 1;

        // When length isn't a multiple of slide, an item can be in one
        // more window than `length / slide`.
        let max_windows = self.length.num_milliseconds() / self.slide.num_milliseconds() + 1;

        let mut windows = Vec::new();
        for i in 0..max_windows {
            let Some(window_open) = self.window_open(first_window_idx + i) else {
                break;
            };
            if *time < window_open {
                break;
            }
            let Some(window_close) = window_open.checked_add_signed(self.length) else {
                break;
            };
            tracing::trace!("{time:?} intersects window [{window_open:?}, {window_close:?})");
            windows.push(Window::new(window_open, window_close));
        }
        windows
    }
}
