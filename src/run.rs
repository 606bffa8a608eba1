//! The micro-batch scheduler.
//!
//! One [`Scheduler`] drives one query on the calling thread:
//!
//! ```text
//! RECOVERING -> IDLE -> POLLING -> PROCESSING -> COMMITTING -> IDLE
//!                          |                                    ^
//!                          +----------- empty poll -------------+
//! ```
//!
//! A batch only becomes visible to the next run once its checkpoint
//! is committed, and the checkpoint is only written after every sink
//! acknowledged the batch's rows. Any error after polling throws the
//! in-memory progress away: the scheduler goes back to `RECOVERING`
//! and reloads the last checkpoint before the next attempt, so a
//! retried batch is merged exactly once into state restored from
//! before it.
//!
//! Shutdown is only looked at before polling and before committing,
//! never while merging.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use tracing::instrument;

use crate::config::OutputMode;
use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::inputs::DirectorySource;
use crate::inputs::Source;
use crate::inputs::SourceCursor;
use crate::metrics::PipelineMetrics;
use crate::outputs::MemorySink;
use crate::outputs::SinkSet;
use crate::outputs::SqliteTableSink;
use crate::outputs::StatRow;
use crate::outputs::StdOutput;
use crate::recovery::CheckpointRecord;
use crate::recovery::CheckpointStore;
use crate::recovery::Commit;
use crate::recovery::SinkStatus;
use crate::recovery::SqliteCheckpointStore;
use crate::state::StateStore;
use crate::window::build_windower;
use crate::window::to_chrono;
use crate::window::Watermark;
use crate::window::WatermarkTracker;
use crate::window::Window;
use crate::window::Windower;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    Recovering,
    Idle,
    Polling,
    Processing,
    Committing,
}

/// Cloneable flag to ask a running scheduler to stop.
///
/// Waiting on the handle wakes up as soon as shutdown is requested, so
/// a scheduler sleeping out its trigger interval stops promptly.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        let (lock, cvar) = &*self.inner;
        if let Ok(mut requested) = lock.lock() {
            *requested = true;
        }
        cvar.notify_all();
    }

    /// A poisoned flag counts as requested.
    pub fn is_requested(&self) -> bool {
        let (lock, _cvar) = &*self.inner;
        lock.lock().map(|requested| *requested).unwrap_or(true)
    }

    /// Sleep up to `timeout`. Returns whether shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        match lock.lock() {
            Ok(requested) => cvar
                .wait_timeout_while(requested, timeout, |requested| !*requested)
                .map(|(requested, _timeout)| *requested)
                .unwrap_or(true),
            Err(_) => true,
        }
    }
}

/// Summary of one committed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub epoch: u64,
    /// Records merged into at least one window.
    pub admitted: usize,
    /// Records dropped as late.
    pub late: usize,
    /// Rows written to the sinks.
    pub emitted: usize,
    pub watermark: Watermark,
}

pub struct Scheduler {
    config: PipelineConfig,
    windower: Box<dyn Windower>,
    source: Box<dyn Source>,
    sinks: SinkSet,
    checkpoints: Box<dyn CheckpointStore>,
    state: SchedulerState,
    store: StateStore,
    tracker: WatermarkTracker,
    cursor: SourceCursor,
    /// Epoch of the last committed batch.
    epoch: u64,
    /// Consecutive aborted batches.
    failures: u32,
    metrics: PipelineMetrics,
}

impl Scheduler {
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn Source>,
        sinks: SinkSet,
        checkpoints: Box<dyn CheckpointStore>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let windower = build_windower(&config)?;
        let lateness = to_chrono(config.lateness_bound)?;
        let metrics = PipelineMetrics::new(&config.query_name);
        Ok(Self {
            store: StateStore::new(config.distinct_precision, lateness),
            tracker: WatermarkTracker::new(lateness, Watermark::MIN),
            config,
            windower,
            source,
            sinks,
            checkpoints,
            state: SchedulerState::Recovering,
            cursor: SourceCursor::default(),
            epoch: 0,
            failures: 0,
            metrics,
        })
    }

    /// Wire up the directory source, the configured sinks and the
    /// SQLite checkpoint store. `diagnostic` receives every emitted row
    /// too, if given.
    pub fn from_config(
        config: PipelineConfig,
        diagnostic: Option<MemorySink>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let source = DirectorySource::from_config(&config);

        let mut sinks = SinkSet::new();
        if let Some(output_path) = &config.output_path {
            sinks.push(Box::new(SqliteTableSink::open(
                output_path,
                &config.query_name,
                config.io_timeout,
            )?));
        }
        if let Some(memory) = diagnostic {
            sinks.push(Box::new(memory));
        }
        if config.console_output {
            sinks.push(Box::new(StdOutput::new()));
        }
        if sinks.is_empty() {
            tracing::warn!("No sinks configured; rows will only be checkpointed");
        }

        let checkpoints = SqliteCheckpointStore::open(
            &config.checkpoint_file(),
            &config.query_name,
            config.io_timeout,
        )?;
        Self::new(config, Box::new(source), sinks, Box::new(checkpoints))
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Epoch of the last committed batch; 0 before the first.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn watermark(&self) -> Watermark {
        self.tracker.current_watermark()
    }

    /// Live window state.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Loop on the trigger interval until shutdown is requested.
    ///
    /// Retryable errors abort the batch and back off; fatal ones are
    /// returned.
    pub fn run(&mut self, shutdown: &ShutdownHandle) -> PipelineResult<()> {
        tracing::info!(
            "Starting query {:?} on {:?}",
            self.config.query_name,
            self.config.input_path
        );
        while !shutdown.is_requested() {
            let started = Instant::now();
            let pause = match self.step(Some(shutdown)) {
                Ok(_) => self
                    .config
                    .trigger_interval
                    .saturating_sub(started.elapsed()),
                Err(err) if err.is_retryable() => self.backoff(),
                Err(err) => return Err(err),
            };
            shutdown.wait(pause);
        }
        tracing::info!("Shutdown requested; stopping query {:?}", self.config.query_name);
        Ok(())
    }

    /// Process a single trigger.
    ///
    /// Returns `None` if there was nothing new to consume.
    pub fn run_once(&mut self) -> PipelineResult<Option<BatchReport>> {
        self.step(None)
    }

    fn step(&mut self, shutdown: Option<&ShutdownHandle>) -> PipelineResult<Option<BatchReport>> {
        let res = self.try_step(shutdown);
        match &res {
            Ok(_) => self.failures = 0,
            Err(err) => self.abort(err),
        }
        res
    }

    fn try_step(
        &mut self,
        shutdown: Option<&ShutdownHandle>,
    ) -> PipelineResult<Option<BatchReport>> {
        if self.state == SchedulerState::Recovering {
            self.recover()?;
        }
        crate::with_timer!(
            self.metrics.batch_duration,
            self.metrics.labels,
            self.process_batch(shutdown)
        )
    }

    fn abort(&mut self, err: &PipelineError) {
        self.state = SchedulerState::Recovering;
        self.metrics
            .batches_aborted
            .add(1, &self.metrics.abort_labels(err.kind()));
        if err.is_retryable() {
            self.failures = self.failures.saturating_add(1);
            tracing::warn!(
                "Aborted batch {} ({} consecutive failures); will recover from checkpoint \
                 and retry: {err}",
                self.epoch + 1,
                self.failures
            );
        } else {
            tracing::error!("Fatal error in batch {}: {err}", self.epoch + 1);
        }
    }

    /// `trigger_interval * 2^failures`, capped, plus up to 10% jitter.
    fn backoff(&self) -> Duration {
        let base = self
            .config
            .trigger_interval
            .saturating_mul(1 << self.failures.min(16))
            .min(self.config.max_backoff);
        let jitter = base.mul_f64(fastrand::f64() * 0.1);
        (base + jitter).min(self.config.max_backoff)
    }

    /// Reset every piece of in-memory progress to the last checkpoint.
    #[instrument(skip(self), fields(query_name = %self.config.query_name))]
    fn recover(&mut self) -> PipelineResult<()> {
        let lateness = self.tracker.lateness();
        match self.checkpoints.load()? {
            Some(resume) => {
                let checkpoint = resume.checkpoint;
                // A finalized window can't still have live state.
                if let Some((window, key, _acc)) = resume
                    .accs
                    .iter()
                    .find(|(window, _key, _acc)| resume.emitted.contains(window))
                {
                    return Err(PipelineError::StoreCorruption(format!(
                        "live accumulator for {key:?} in already emitted window {window:?}"
                    )));
                }
                self.store = StateStore::restore(
                    self.config.distinct_precision,
                    lateness,
                    checkpoint.watermark,
                    resume.accs,
                )?;
                self.tracker = WatermarkTracker::new(lateness, checkpoint.watermark);
                self.cursor = checkpoint.cursor;
                self.epoch = checkpoint.epoch;
                self.source.resume(&resume.files);
                tracing::info!(
                    "Resuming after epoch {} at cursor {} and watermark {}; {} live windows, \
                     {} committed files",
                    checkpoint.epoch,
                    checkpoint.cursor.seq,
                    checkpoint.watermark,
                    self.store.len(),
                    resume.files.len()
                );
            }
            None => {
                self.store = StateStore::new(self.config.distinct_precision, lateness);
                self.tracker = WatermarkTracker::new(lateness, Watermark::MIN);
                self.cursor = SourceCursor::default();
                self.epoch = 0;
                self.source.resume(&[]);
                tracing::info!("No checkpoint found; starting fresh");
            }
        }
        self.state = SchedulerState::Idle;
        Ok(())
    }

    fn process_batch(
        &mut self,
        shutdown: Option<&ShutdownHandle>,
    ) -> PipelineResult<Option<BatchReport>> {
        let epoch = self.epoch + 1;
        let span = tracing::info_span!("batch", epoch);
        let _guard = span.enter();

        self.state = SchedulerState::Polling;
        let poll = self.source.poll(&self.cursor)?;
        if poll.skipped > 0 {
            self.metrics
                .files_skipped
                .add(poll.skipped as u64, &self.metrics.labels);
        }
        if poll.is_empty() {
            tracing::trace!("Nothing new at cursor {}", self.cursor.seq);
            self.state = SchedulerState::Idle;
            return Ok(None);
        }

        self.state = SchedulerState::Processing;
        let observed = self.tracker.observe(poll.records, self.windower.as_ref());
        let watermark = observed.watermark;
        let late = observed.late.len();
        let admitted = observed.admitted.len();
        for (record, windows) in &observed.admitted {
            for window in windows {
                self.store.merge(*window, &record.key, record)?;
            }
        }
        let evicted = self.store.evict(watermark)?;

        let mut rows: Vec<StatRow> = match self.config.output_mode {
            OutputMode::Append => Vec::new(),
            OutputMode::Complete => self
                .store
                .changes()
                .map(|(window, key, acc)| acc.to_row(window, key))
                .collect(),
        };
        rows.extend(
            evicted
                .iter()
                .map(|evicted| evicted.acc.to_row(&evicted.window, &evicted.key)),
        );
        let emitted_windows: Vec<Window> = match self.config.output_mode {
            OutputMode::Append => evicted
                .iter()
                .map(|evicted| evicted.window)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            OutputMode::Complete => Vec::new(),
        };

        if shutdown.is_some_and(ShutdownHandle::is_requested) {
            tracing::info!("Shutdown requested; abandoning uncommitted batch");
            self.state = SchedulerState::Recovering;
            return Ok(None);
        }

        self.state = SchedulerState::Committing;
        let sink_status = if rows.is_empty() {
            SinkStatus::NothingToWrite
        } else {
            self.sinks.write_batch(epoch, &rows)?;
            SinkStatus::Acknowledged
        };
        let commit = Commit {
            record: CheckpointRecord {
                epoch,
                cursor: poll.new_cursor,
                watermark,
                sink_status,
            },
            files: poll
                .files
                .iter()
                .map(|file| (file.seq, file.path.as_path()))
                .collect(),
            upserts: self.store.changes().collect(),
            evicted: evicted
                .iter()
                .map(|evicted| (&evicted.window, &evicted.key))
                .collect(),
            emitted: emitted_windows,
        };
        self.checkpoints.commit(&commit)?;

        self.source.mark_committed(&poll.files);
        self.store.clear_changes();
        self.cursor = poll.new_cursor;
        self.epoch = epoch;
        self.state = SchedulerState::Idle;

        let labels = &self.metrics.labels;
        self.metrics.records_admitted.add(admitted as u64, labels);
        self.metrics.records_late.add(late as u64, labels);
        self.metrics.rows_emitted.add(rows.len() as u64, labels);
        self.metrics.batches_committed.add(1, labels);
        if late > 0 {
            tracing::debug!("Dropped {late} late records at watermark {watermark}");
        }
        tracing::info!(
            "Committed batch: {} files, {admitted} admitted, {late} late, {} rows, \
             watermark {watermark}",
            poll.files.len(),
            rows.len()
        );
        Ok(Some(BatchReport {
            epoch,
            admitted,
            late,
            emitted: rows.len(),
            watermark,
        }))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("query_name", &self.config.query_name)
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("cursor", &self.cursor)
            .field("watermark", &self.tracker.current_watermark())
            .field("live_windows", &self.store.len())
            .finish()
    }
}
