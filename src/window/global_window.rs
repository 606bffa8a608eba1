use chrono::prelude::*;

use super::Window;
use super::Windower;

/// Puts every item into the one all-time [`Window::global`].
///
/// Used for the plain (un-windowed) aggregation. The global window
/// never closes, so its rows are only ever published in `complete`
/// output mode.
#[derive(Debug, Clone, Copy)]
pub struct GlobalWindower;

impl Windower for GlobalWindower {
    fn intersects(&self, _time: &DateTime<Utc>) -> Vec<Window> {
        vec![Window::global()]
    }
}

#[test]
fn test_everything_is_in_the_global_window() {
    let early = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
    assert_eq!(GlobalWindower.intersects(&early), GlobalWindower.intersects(&late));
}
