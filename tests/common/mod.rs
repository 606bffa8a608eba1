#![allow(dead_code)]

use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use chrono::prelude::*;
use hotel_stats::outputs::Sink;
use hotel_stats::outputs::StatRow;
use hotel_stats::record::GroupKey;
use hotel_stats::record::Record;
use hotel_stats::recovery::CheckpointStore;
use hotel_stats::recovery::Commit;
use hotel_stats::recovery::ResumeState;
use hotel_stats::window::Window;
use hotel_stats::PipelineError;
use hotel_stats::PipelineResult;

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 1, 1, h, m, s).unwrap()
}

pub fn window(start: DateTime<Utc>, minutes: i64) -> Window {
    Window::new(start, start + chrono::Duration::minutes(minutes))
}

pub fn observation(city: &str, time: DateTime<Utc>, hotel: &str, c: f64) -> Record {
    Record::observation(GroupKey::new(city, "2021-01-01"), time, hotel, c)
}

/// Checkpoint store that fails the commit of chosen epochs once,
/// simulating a crash after the sinks were written.
pub struct FlakyCheckpoints<S> {
    inner: S,
    fail_epochs: Vec<u64>,
}

impl<S> FlakyCheckpoints<S> {
    pub fn new(inner: S, fail_epochs: Vec<u64>) -> Self {
        Self { inner, fail_epochs }
    }
}

impl<S: CheckpointStore> CheckpointStore for FlakyCheckpoints<S> {
    fn load(&mut self) -> PipelineResult<Option<ResumeState>> {
        self.inner.load()
    }

    fn commit(&mut self, commit: &Commit<'_>) -> PipelineResult<()> {
        let epoch = commit.record.epoch;
        if let Some(pos) = self.fail_epochs.iter().position(|e| *e == epoch) {
            self.fail_epochs.remove(pos);
            return Err(PipelineError::CheckpointWriteFailure(format!(
                "lost power while committing epoch {epoch}"
            )));
        }
        self.inner.commit(commit)
    }
}

/// Sink that rejects its first `failures` writes.
pub struct FlakySink {
    failures: usize,
}

impl FlakySink {
    pub fn new(failures: usize) -> Self {
        Self { failures }
    }
}

impl Sink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    fn write_batch(&mut self, epoch: u64, _rows: &[StatRow]) -> PipelineResult<()> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(PipelineError::SinkWriteFailure(format!(
                "table locked during epoch {epoch}"
            )));
        }
        Ok(())
    }
}

/// Write a JSON lines input file and set its modification time, which
/// becomes the event time of every row in it.
pub fn write_input(dir: &Path, name: &str, modified: DateTime<Utc>, rows: &[(&str, &str, f64)]) -> PathBuf {
    let path = dir.join(name);
    let body: Vec<String> = rows
        .iter()
        .map(|(id, city, c)| {
            serde_json::json!({
                "id": id,
                "address": null,
                "name": null,
                "latitude": 50.45,
                "longitude": 30.52,
                "city": city,
                "wthr_date": "2021-01-01",
                "avg_tmpr_c": c,
                "avg_tmpr_f": c * 9.0 / 5.0 + 32.0,
                "country": "UA",
                "geoHash": "u8vx",
            })
            .to_string()
        })
        .collect();
    fs::write(&path, body.join("\n")).unwrap();
    let secs = u64::try_from(modified.timestamp()).unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
    path
}
