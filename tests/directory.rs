use std::fs;
use std::time::Duration;

use hotel_stats::outputs::MemorySink;
use hotel_stats::outputs::SqliteTableSink;
use hotel_stats::PipelineConfig;
use hotel_stats::Scheduler;

mod common;
use common::*;

fn config(root: &std::path::Path) -> PipelineConfig {
    let input = root.join("input");
    fs::create_dir_all(&input).unwrap();
    let mut config = PipelineConfig::new(input, root.join("checkpoints"));
    config.output_path = Some(root.join("statistics.sqlite3"));
    config
}

#[test]
fn directory_query_survives_restart() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let input = config.input_path.clone();
    let table_file = config.output_path.clone().unwrap();

    write_input(
        &input,
        "part-0000.json",
        at(12, 0, 0),
        &[("h1", "Kyiv", 10.0), ("h2", "Kyiv", 12.0), ("h1", "Kyiv", 14.0)],
    );
    // Neither of these is input.
    fs::write(input.join("_SUCCESS"), "").unwrap();
    fs::write(input.join(".part-0001.json.crc"), "garbage").unwrap();

    let diagnostic = MemorySink::new();
    let mut sched = Scheduler::from_config(config.clone(), Some(diagnostic.clone())).unwrap();
    let first = sched.run_once().unwrap().unwrap();
    assert_eq!(first.admitted, 3);
    assert_eq!(first.emitted, 0);
    assert_eq!(sched.run_once().unwrap(), None);

    write_input(&input, "part-0001.json", at(12, 20, 0), &[("h7", "Lviv", 3.0)]);
    let second = sched.run_once().unwrap().unwrap();
    assert_eq!(second.epoch, 2);
    assert_eq!(second.emitted, 2);
    assert_eq!(diagnostic.len(), 2);
    drop(sched);

    let table = SqliteTableSink::open(&table_file, &config.query_name, Duration::from_secs(5)).unwrap();
    let kyiv = table.rows(Some("Kyiv"), None).unwrap();
    assert_eq!(kyiv.len(), 2);
    assert!(kyiv.iter().all(|row| row.records == 3 && row.distinct_hotel_count == 2));

    // A restarted query does not re-read committed files and keeps
    // the open Lviv windows.
    let mut restarted = Scheduler::from_config(config.clone(), None).unwrap();
    assert_eq!(restarted.run_once().unwrap(), None);
    assert_eq!(restarted.epoch(), 2);
    assert_eq!(restarted.store().len(), 2);

    write_input(&input, "part-0002.json", at(13, 0, 0), &[("h8", "Odesa", 5.0)]);
    let third = restarted.run_once().unwrap().unwrap();
    assert_eq!(third.epoch, 3);
    assert_eq!(third.emitted, 2);
    let lviv = table.rows(Some("Lviv"), None).unwrap();
    assert_eq!(lviv.len(), 2);
    assert_eq!(table.rows(None, None).unwrap().len(), 4);
    assert_eq!(
        table.top_cities(1).unwrap(),
        vec![("Kyiv".to_string(), 2)]
    );
}

#[test]
fn undecodable_file_is_skipped_and_not_retried() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    let input = config.input_path.clone();

    fs::write(input.join("broken.json"), "{not json").unwrap();
    write_input(&input, "good.json", at(12, 0, 0), &[("h1", "Kyiv", 10.0)]);

    let mut sched = Scheduler::from_config(config.clone(), None).unwrap();
    let report = sched.run_once().unwrap().unwrap();
    assert_eq!(report.admitted, 1);
    assert_eq!(sched.run_once().unwrap(), None);

    let mut restarted = Scheduler::from_config(config, None).unwrap();
    assert_eq!(restarted.run_once().unwrap(), None);
}
