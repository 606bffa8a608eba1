use std::path::PathBuf;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::record::Record;

use super::DiscoveredFile;
use super::Poll;
use super::Source;
use super::SourceCursor;

/// Source of pre-built batches, one per poll.
///
/// The cursor is the number of batches consumed, so re-polling a
/// cursor replays the same batch. Each batch is reported as one
/// synthetic file.
#[derive(Debug, Clone, Default)]
pub struct TestingSource {
    batches: Vec<Vec<Record>>,
    failures_left: usize,
}

impl TestingSource {
    pub fn new(batches: Vec<Vec<Record>>) -> Self {
        Self {
            batches,
            failures_left: 0,
        }
    }

    /// Fail the next `count` polls with
    /// [`PipelineError::SourceUnavailable`].
    pub fn failing_first(mut self, count: usize) -> Self {
        self.failures_left = count;
        self
    }
}

impl Source for TestingSource {
    fn poll(&mut self, cursor: &SourceCursor) -> PipelineResult<Poll> {
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(PipelineError::SourceUnavailable(
                "testing source is down".into(),
            ));
        }
        let Some(batch) = usize::try_from(cursor.seq)
            .ok()
            .and_then(|idx| self.batches.get(idx))
        else {
            return Ok(Poll {
                new_cursor: *cursor,
                ..Default::default()
            });
        };
        let seq = cursor.seq + 1;
        Ok(Poll {
            records: batch.clone(),
            new_cursor: SourceCursor { seq },
            files: vec![DiscoveredFile {
                seq,
                path: PathBuf::from(format!("batch-{seq}")),
                records: Some(batch.len()),
            }],
            skipped: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::prelude::*;

    use super::*;
    use crate::record::GroupKey;

    #[test]
    fn replays_batches_by_cursor() {
        let record = Record::observation(
            GroupKey::new("Kyiv", "2021-01-01"),
            Utc.with_ymd_and_hms(2021, 1, 1, 12, 0, 0).unwrap(),
            "h1",
            10.0,
        );
        let mut source = TestingSource::new(vec![vec![record.clone()], vec![]]).failing_first(1);

        assert!(source.poll(&SourceCursor::default()).is_err());
        let first = source.poll(&SourceCursor::default()).unwrap();
        assert_eq!(first.records, vec![record]);
        assert_eq!(first.new_cursor.seq, 1);

        let second = source.poll(&first.new_cursor).unwrap();
        assert!(second.records.is_empty());
        assert!(!second.is_empty());

        let done = source.poll(&second.new_cursor).unwrap();
        assert!(done.is_empty());
        assert_eq!(done.new_cursor, second.new_cursor);
    }
}
