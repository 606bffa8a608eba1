use std::time::Duration;
use std::time::Instant;

use hotel_stats::config::Aggregation;
use hotel_stats::config::OutputMode;
use hotel_stats::inputs::TestingSource;
use hotel_stats::outputs::MemorySink;
use hotel_stats::outputs::SinkSet;
use hotel_stats::outputs::SqliteTableSink;
use hotel_stats::record::GroupKey;
use hotel_stats::record::Record;
use hotel_stats::recovery::CheckpointStore;
use hotel_stats::recovery::SqliteCheckpointStore;
use hotel_stats::run::SchedulerState;
use hotel_stats::window::Watermark;
use hotel_stats::window::Window;
use hotel_stats::PipelineConfig;
use hotel_stats::PipelineError;
use hotel_stats::Scheduler;
use hotel_stats::ShutdownHandle;

mod common;
use common::*;

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::new("unused-input", "unused-checkpoints");
    config.window_length = Duration::from_secs(2 * 60);
    config.slide_interval = Duration::from_secs(60);
    config.lateness_bound = Duration::from_secs(5 * 60);
    config
}

fn scheduler(
    config: PipelineConfig,
    batches: Vec<Vec<Record>>,
    sinks: SinkSet,
    checkpoints: Box<dyn CheckpointStore>,
) -> Scheduler {
    Scheduler::new(
        config,
        Box::new(TestingSource::new(batches)),
        sinks,
        checkpoints,
    )
    .unwrap()
}

fn in_memory_checkpoints() -> Box<dyn CheckpointStore> {
    Box::new(SqliteCheckpointStore::in_memory("hotel_statistics").unwrap())
}

fn kyiv_batch() -> Vec<Record> {
    vec![
        observation("Kyiv", at(12, 0, 10), "h1", 10.0),
        observation("Kyiv", at(12, 0, 20), "h2", 12.0),
        observation("Kyiv", at(12, 0, 30), "h1", 14.0),
    ]
}

fn kyiv() -> GroupKey {
    GroupKey::new("Kyiv", "2021-01-01")
}

/// Run until the source is drained, returning how many batches were
/// aborted on the way.
fn drain(scheduler: &mut Scheduler) -> usize {
    let mut aborted = 0;
    for _ in 0..50 {
        match scheduler.run_once() {
            Ok(Some(_report)) => {}
            Ok(None) => return aborted,
            Err(err) => {
                assert!(err.is_retryable(), "{err}");
                aborted += 1;
            }
        }
    }
    panic!("scheduler never drained its source");
}

#[test]
fn kyiv_window_is_finalized_once_watermark_passes() {
    let sink = MemorySink::new();
    let mut sched = scheduler(
        config(),
        vec![kyiv_batch(), vec![observation("Lviv", at(12, 20, 0), "h7", 3.0)]],
        SinkSet::new().with(sink.clone()),
        in_memory_checkpoints(),
    );

    let first = sched.run_once().unwrap().unwrap();
    assert_eq!(first.admitted, 3);
    assert_eq!(first.late, 0);
    assert_eq!(first.emitted, 0);
    assert_eq!(first.watermark, Watermark::at(at(11, 55, 30)));
    assert!(sink.is_empty());

    // Watermark 12:15 is past 12:02 + 5 minutes.
    let second = sched.run_once().unwrap().unwrap();
    assert_eq!(second.epoch, 2);
    assert_eq!(second.emitted, 2);
    assert_eq!(sched.state(), SchedulerState::Idle);

    let row = sink.get(&(window(at(12, 0, 0), 2), kyiv())).unwrap();
    assert_eq!(row.records, 3);
    assert_eq!(row.distinct_hotel_count, 2);
    assert_eq!(row.avg_avg_tmpr_c, Some(12.0));
    assert_eq!(row.min_avg_tmpr_c, Some(10.0));
    assert_eq!(row.max_avg_tmpr_c, Some(14.0));
    assert_eq!(row.min_avg_tmpr_f, Some(50.0));
    assert!(sink.get(&(window(at(11, 59, 0), 2), kyiv())).is_some());
    assert!(sink.rows_for_city("Lviv").is_empty());
}

#[test]
fn late_record_is_counted_and_excluded() {
    let sink = MemorySink::new();
    let mut sched = scheduler(
        config(),
        vec![
            vec![observation("Kyiv", at(12, 30, 0), "h1", 10.0)],
            vec![
                observation("Kyiv", at(12, 19, 0), "h2", 40.0),
                observation("Kyiv", at(12, 30, 30), "h3", 12.0),
            ],
            vec![observation("Kyiv", at(13, 0, 0), "h1", 0.0)],
        ],
        SinkSet::new().with(sink.clone()),
        in_memory_checkpoints(),
    );

    sched.run_once().unwrap();
    let second = sched.run_once().unwrap().unwrap();
    assert_eq!(second.late, 1);
    assert_eq!(second.admitted, 1);
    sched.run_once().unwrap();

    assert!(sink.get(&(window(at(12, 18, 0), 2), kyiv())).is_none());
    assert!(sink.get(&(window(at(12, 19, 0), 2), kyiv())).is_none());
    let row = sink.get(&(window(at(12, 30, 0), 2), kyiv())).unwrap();
    assert_eq!(row.records, 2);
    assert_eq!(row.max_avg_tmpr_c, Some(12.0));
}

#[test]
fn complete_mode_republishes_changed_windows() {
    let sink = MemorySink::new();
    let mut config = config();
    config.output_mode = OutputMode::Complete;
    let mut sched = scheduler(
        config,
        vec![
            vec![observation("Kyiv", at(12, 0, 0), "h1", 10.0)],
            vec![observation("Kyiv", at(12, 0, 30), "h2", 20.0)],
        ],
        SinkSet::new().with(sink.clone()),
        in_memory_checkpoints(),
    );

    assert_eq!(sched.run_once().unwrap().unwrap().emitted, 2);
    assert_eq!(sink.len(), 2);
    assert_eq!(sched.run_once().unwrap().unwrap().emitted, 2);
    assert_eq!(sink.len(), 2);

    let row = sink.get(&(window(at(12, 0, 0), 2), kyiv())).unwrap();
    assert_eq!(row.records, 2);
    assert_eq!(row.avg_avg_tmpr_c, Some(15.0));
}

#[test]
fn plain_aggregation_keeps_one_all_time_row() {
    let sink = MemorySink::new();
    let mut config = config();
    config.aggregation = Aggregation::Plain;
    config.output_mode = OutputMode::Complete;
    let mut sched = scheduler(
        config,
        vec![
            vec![observation("Kyiv", at(1, 0, 0), "h1", 10.0)],
            vec![observation("Kyiv", at(23, 0, 0), "h2", 20.0)],
            vec![observation("Kyiv", at(0, 0, 0), "h3", 30.0)],
        ],
        SinkSet::new().with(sink.clone()),
        in_memory_checkpoints(),
    );
    assert_eq!(drain(&mut sched), 0);

    assert_eq!(sink.len(), 1);
    let row = sink.get(&(Window::global(), kyiv())).unwrap();
    assert_eq!(row.records, 3);
    assert_eq!(row.distinct_hotel_count, 3);
}

#[test]
fn crash_between_sink_write_and_checkpoint_replays_same_rows() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_file = dir.path().join("hotel_statistics.checkpoint.sqlite3");
    let table_file = dir.path().join("statistics.sqlite3");
    let timeout = Duration::from_secs(5);
    let open_checkpoints =
        || SqliteCheckpointStore::open(&checkpoint_file, "hotel_statistics", timeout).unwrap();
    let open_table = || SqliteTableSink::open(&table_file, "hotel_statistics", timeout).unwrap();
    let batches = vec![
        kyiv_batch(),
        vec![observation("Lviv", at(12, 20, 0), "h7", 3.0)],
    ];

    let mut crashing = scheduler(
        config(),
        batches.clone(),
        SinkSet::new().with(open_table()),
        Box::new(FlakyCheckpoints::new(open_checkpoints(), vec![2])),
    );
    assert_eq!(crashing.run_once().unwrap().unwrap().epoch, 1);
    let err = crashing.run_once().unwrap_err();
    assert!(matches!(err, PipelineError::CheckpointWriteFailure(_)));
    assert_eq!(crashing.state(), SchedulerState::Recovering);
    drop(crashing);

    let written = open_table().rows(None, None).unwrap();
    assert_eq!(written.len(), 2);

    // Restart from scratch against the same files.
    let mut restarted = scheduler(
        config(),
        batches,
        SinkSet::new().with(open_table()),
        Box::new(open_checkpoints()),
    );
    let report = restarted.run_once().unwrap().unwrap();
    assert_eq!(report.epoch, 2);
    assert_eq!(report.emitted, 2);
    assert_eq!(restarted.run_once().unwrap(), None);

    let replayed = open_table().rows(None, None).unwrap();
    assert_eq!(replayed, written);
    assert!(replayed.iter().all(|row| row.records == 3));
}

#[test]
fn retried_batches_match_an_uninterrupted_run() {
    let batches = vec![
        kyiv_batch(),
        vec![
            observation("Lviv", at(12, 3, 0), "h7", 3.0),
            observation("Kyiv", at(12, 4, 0), "h2", 11.0),
        ],
        vec![observation("Odesa", at(12, 9, 0), "h9", 8.0)],
        vec![observation("Odesa", at(12, 40, 0), "h9", 9.0)],
    ];

    let clean = MemorySink::new();
    let mut uninterrupted = scheduler(
        config(),
        batches.clone(),
        SinkSet::new().with(clean.clone()),
        in_memory_checkpoints(),
    );
    assert_eq!(drain(&mut uninterrupted), 0);

    let replayed = MemorySink::new();
    let mut flaky = Scheduler::new(
        config(),
        Box::new(TestingSource::new(batches).failing_first(1)),
        SinkSet::new()
            .with(replayed.clone())
            .with(FlakySink::new(1)),
        Box::new(FlakyCheckpoints::new(
            SqliteCheckpointStore::in_memory("hotel_statistics").unwrap(),
            vec![2, 3, 4],
        )),
    )
    .unwrap();
    assert_eq!(drain(&mut flaky), 5);

    assert!(!clean.is_empty());
    assert_eq!(replayed.rows(), clean.rows());
    assert_eq!(flaky.epoch(), uninterrupted.epoch());
    assert_eq!(flaky.watermark(), uninterrupted.watermark());
}

#[test]
fn restored_temperatures_are_bit_exact() {
    let temps = [0.1, 0.2, 0.7, 13.37, -2.05, 21.9, 1.0 / 3.0, 36.6, 0.30000000000000004];
    let mut batches: Vec<Vec<Record>> = temps
        .iter()
        .zip(0..)
        .map(|(c, i)| vec![observation("Kyiv", at(12, 0, i * 5), &format!("h{i}"), *c)])
        .collect();
    batches.push(vec![observation("Lviv", at(12, 30, 0), "h99", 3.0)]);

    let clean = MemorySink::new();
    let mut uninterrupted = scheduler(
        config(),
        batches.clone(),
        SinkSet::new().with(clean.clone()),
        in_memory_checkpoints(),
    );
    assert_eq!(drain(&mut uninterrupted), 0);

    // Every batch after the first resumes from the stored accumulators.
    let replayed = MemorySink::new();
    let mut flaky = scheduler(
        config(),
        batches,
        SinkSet::new().with(replayed.clone()),
        Box::new(FlakyCheckpoints::new(
            SqliteCheckpointStore::in_memory("hotel_statistics").unwrap(),
            (2..=10).collect(),
        )),
    );
    assert_eq!(drain(&mut flaky), 9);

    let row = clean.get(&(window(at(12, 0, 0), 2), kyiv())).unwrap();
    assert_eq!(row.records, temps.len() as u64);
    assert_eq!(replayed.rows(), clean.rows());
}

#[test]
fn infinite_temperature_does_not_lose_the_checkpoint() {
    let sink = MemorySink::new();
    let mut sched = scheduler(
        config(),
        vec![
            vec![observation("Kyiv", at(12, 0, 10), "h1", 10.0)],
            vec![observation("Kyiv", at(12, 0, 20), "h2", f64::INFINITY)],
            vec![observation("Kyiv", at(12, 0, 30), "h3", 14.0)],
            vec![observation("Lviv", at(12, 20, 0), "h7", 3.0)],
        ],
        SinkSet::new().with(sink.clone()),
        Box::new(FlakyCheckpoints::new(
            SqliteCheckpointStore::in_memory("hotel_statistics").unwrap(),
            vec![3],
        )),
    );

    assert_eq!(sched.run_once().unwrap().unwrap().epoch, 1);
    assert_eq!(sched.run_once().unwrap().unwrap().epoch, 2);
    assert!(sched.run_once().unwrap_err().is_retryable());

    // Resumed from epoch 2, not from scratch.
    let report = sched.run_once().unwrap().unwrap();
    assert_eq!(report.epoch, 3);
    assert_eq!(report.admitted, 1);
    assert_eq!(sched.epoch(), 3);
    assert_eq!(drain(&mut sched), 0);

    let row = sink.get(&(window(at(12, 0, 0), 2), kyiv())).unwrap();
    assert_eq!(row.records, 3);
    assert_eq!(row.min_avg_tmpr_c, Some(10.0));
    assert_eq!(row.max_avg_tmpr_c, Some(14.0));
    assert_eq!(row.avg_avg_tmpr_c, Some(12.0));
}

#[test]
fn changed_sketch_precision_is_fatal_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_file = dir.path().join("checkpoint.sqlite3");
    let timeout = Duration::from_secs(5);

    let mut first = scheduler(
        config(),
        vec![kyiv_batch()],
        SinkSet::new(),
        Box::new(SqliteCheckpointStore::open(&checkpoint_file, "hotel_statistics", timeout).unwrap()),
    );
    first.run_once().unwrap();
    drop(first);

    let mut config = config();
    config.distinct_precision = 12;
    let mut second = scheduler(
        config,
        vec![kyiv_batch()],
        SinkSet::new(),
        Box::new(SqliteCheckpointStore::open(&checkpoint_file, "hotel_statistics", timeout).unwrap()),
    );
    let err = second.run_once().unwrap_err();
    assert!(matches!(err, PipelineError::StoreCorruption(_)));
    assert!(err.is_fatal());
}

#[test]
fn run_stops_on_shutdown() {
    let sink = MemorySink::new();
    let mut config = config();
    config.output_mode = OutputMode::Complete;
    config.trigger_interval = Duration::from_millis(10);
    let mut sched = scheduler(
        config,
        vec![kyiv_batch()],
        SinkSet::new().with(sink.clone()),
        in_memory_checkpoints(),
    );

    let shutdown = ShutdownHandle::new();
    let handle = shutdown.clone();
    let runner = std::thread::spawn(move || sched.run(&handle));

    let started = Instant::now();
    while sink.is_empty() && started.elapsed() < Duration::from_secs(10) {
        std::thread::sleep(Duration::from_millis(5));
    }
    shutdown.request();
    runner.join().unwrap().unwrap();
    assert_eq!(sink.len(), 2);
}
