use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use chrono::DateTime;
use chrono::Utc;

use crate::config::EventTime;
use crate::config::PipelineConfig;
use crate::errors::Classify;
use crate::errors::PipelineError;
use crate::errors::PipelineResult;

use super::decode::decode_file;
use super::DiscoveredFile;
use super::Poll;
use super::Source;
use super::SourceCursor;

/// Watches a directory of immutable input files.
///
/// Every poll lists the directory (non-recursively), skips hidden and
/// `_`-prefixed files and anything already committed, and consumes
/// the rest oldest first by modification time, then path.
///
/// The committed set holds one path per consumed file and is never
/// pruned, so memory grows with the number of files the query has
/// seen. Input directories are expected to be rotated between runs.
#[derive(Debug)]
pub struct DirectorySource {
    dir: PathBuf,
    event_time: EventTime,
    max_files: Option<usize>,
    timeout: Duration,
    committed: HashSet<PathBuf>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            event_time: EventTime::default(),
            max_files: None,
            timeout: Duration::from_secs(60),
            committed: HashSet::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.input_path)
            .event_time(config.event_time)
            .max_files_per_trigger(config.max_files_per_trigger)
            .timeout(config.io_timeout)
    }

    pub fn event_time(mut self, event_time: EventTime) -> Self {
        self.event_time = event_time;
        self
    }

    pub fn max_files_per_trigger(mut self, max_files: Option<usize>) -> Self {
        self.max_files = max_files;
        self
    }

    /// A poll taking longer than this fails.
    ///
    /// The deadline is only checked between files, so a single read that
    /// hangs (a stalled network mount) still blocks the poll until the
    /// OS gives up on it. The SQLite stores only get this as their busy
    /// timeout, which does not cover a stalled fsync.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Treat these files as already consumed.
    pub fn with_committed(mut self, committed: impl IntoIterator<Item = PathBuf>) -> Self {
        self.committed = committed.into_iter().collect();
        self
    }

    /// Unseen files in consumption order.
    fn list_new(&self) -> PipelineResult<Vec<(SystemTime, PathBuf)>> {
        let entries = fs::read_dir(&self.dir)
            .source_unavailable(&format!("error listing input dir {:?}", self.dir))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.source_unavailable("error reading input dir entry")?;
            let path = entry.path();
            if is_ignored(&path) || self.committed.contains(&path) {
                continue;
            }
            let meta = entry
                .metadata()
                .source_unavailable(&format!("error reading metadata of {path:?}"))?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .source_unavailable(&format!("error reading mtime of {path:?}"))?;
            found.push((modified, path));
        }
        found.sort();
        Ok(found)
    }
}

/// Hidden and `_`-prefixed files (`_SUCCESS`, `.crc`s, in-progress
/// writes) are never input.
fn is_ignored(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.') || name.starts_with('_'))
}

impl Source for DirectorySource {
    fn poll(&mut self, cursor: &SourceCursor) -> PipelineResult<Poll> {
        let started = Instant::now();
        let mut found = self.list_new()?;
        if let Some(max_files) = self.max_files {
            found.truncate(max_files);
        }

        let mut poll = Poll {
            new_cursor: *cursor,
            ..Default::default()
        };
        for (modified, path) in found {
            if started.elapsed() > self.timeout {
                return Err(PipelineError::SourceUnavailable(format!(
                    "poll of {:?} took longer than {:?}",
                    self.dir, self.timeout
                )));
            }
            let event_time = match self.event_time {
                EventTime::FileModified => DateTime::<Utc>::from(modified),
                EventTime::Ingestion => Utc::now(),
            };
            poll.new_cursor.seq += 1;
            let records = match decode_file(&path, event_time) {
                Ok(records) => {
                    tracing::debug!("Decoded {} records from {path:?}", records.len());
                    let count = records.len();
                    poll.records.extend(records);
                    Some(count)
                }
                Err(err) => {
                    tracing::warn!("Skipping input file: {err}");
                    poll.skipped += 1;
                    None
                }
            };
            poll.files.push(DiscoveredFile {
                seq: poll.new_cursor.seq,
                path,
                records,
            });
        }
        Ok(poll)
    }

    fn mark_committed(&mut self, files: &[DiscoveredFile]) {
        self.committed
            .extend(files.iter().map(|file| file.path.clone()));
    }

    fn resume(&mut self, committed: &[PathBuf]) {
        self.committed = committed.iter().cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;
    use crate::inputs::decode::tests::json_row;
    use crate::inputs::decode::tests::write_parquet;

    fn touch(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000 + secs))
            .unwrap();
    }

    fn json_file(dir: &Path, name: &str, city: &str, secs: u64) -> PathBuf {
        let path = dir.join(name);
        let row = json_row(&format!(r#""id": "h1", "city": "{city}", "avg_tmpr_c": 10"#));
        fs::write(&path, row).unwrap();
        touch(&path, secs);
        path
    }

    #[test]
    fn polls_new_files_in_mtime_order() {
        let dir = tempfile::tempdir().unwrap();
        let b = json_file(dir.path(), "b.json", "Lviv", 1);
        let a = json_file(dir.path(), "a.json", "Kyiv", 2);
        json_file(dir.path(), "_SUCCESS.json", "Odesa", 0);
        json_file(dir.path(), ".hidden.json", "Odesa", 0);

        let mut source = DirectorySource::new(dir.path());
        let poll = source.poll(&SourceCursor::default()).unwrap();
        assert_eq!(poll.new_cursor, SourceCursor { seq: 2 });
        assert_eq!(
            poll.files.iter().map(|file| &file.path).collect::<Vec<_>>(),
            vec![&b, &a]
        );
        assert_eq!(poll.records[0].key.city, "Lviv");
        assert_eq!(
            poll.records[0].event_time,
            DateTime::<Utc>::from(SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_001))
        );
    }

    #[test]
    fn repoll_returns_same_files_until_committed() {
        let dir = tempfile::tempdir().unwrap();
        json_file(dir.path(), "a.json", "Kyiv", 1);

        let mut source = DirectorySource::new(dir.path());
        let first = source.poll(&SourceCursor::default()).unwrap();
        let again = source.poll(&SourceCursor::default()).unwrap();
        assert_eq!(first.files, again.files);

        source.mark_committed(&first.files);
        json_file(dir.path(), "b.json", "Lviv", 2);
        let next = source.poll(&first.new_cursor).unwrap();
        assert_eq!(next.files.len(), 1);
        assert_eq!(next.files[0].seq, 2);
        assert_eq!(next.records[0].key.city, "Lviv");

        // Resuming from a checkpoint that never saw `b.json`.
        source.resume(&[first.files[0].path.clone()]);
        let replay = source.poll(&first.new_cursor).unwrap();
        assert_eq!(replay.files, next.files);
    }

    #[test]
    fn respects_max_files_per_trigger() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            json_file(dir.path(), &format!("{i}.json"), "Kyiv", i);
        }

        let mut source = DirectorySource::new(dir.path()).max_files_per_trigger(Some(2));
        let poll = source.poll(&SourceCursor::default()).unwrap();
        assert_eq!(poll.files.len(), 2);
        assert_eq!(poll.new_cursor.seq, 2);
    }

    #[test]
    fn skips_undecodable_files() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.parquet");
        fs::write(&bad, b"nope").unwrap();
        touch(&bad, 1);
        let good = dir.path().join("good.parquet");
        write_parquet(&good, &[("h1", Some("Kyiv"), Some("2021-01-01"), Some(10.0))]);
        touch(&good, 2);

        let mut source = DirectorySource::new(dir.path());
        let poll = source.poll(&SourceCursor::default()).unwrap();
        assert_eq!(poll.skipped, 1);
        assert_eq!(poll.files.len(), 2);
        assert_eq!(poll.files[0].records, None);
        assert_eq!(poll.files[1].records, Some(1));
        assert_eq!(poll.records.len(), 1);
    }

    #[test]
    fn missing_dir_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = DirectorySource::new(dir.path().join("nope"));
        assert!(matches!(
            source.poll(&SourceCursor::default()),
            Err(PipelineError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn ingestion_time_uses_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        json_file(dir.path(), "a.json", "Kyiv", 1);

        let before = Utc::now();
        let mut source = DirectorySource::new(dir.path()).event_time(EventTime::Ingestion);
        let poll = source.poll(&SourceCursor::default()).unwrap();
        assert!(poll.records[0].event_time >= before);
    }
}
