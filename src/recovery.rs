//! Internal code for implementing recovery.
//!
//! Progress of a query is persisted in a SQLite file per query, the
//! "checkpoint store". Each committed batch writes, in a single
//! transaction:
//!
//! - One [`CheckpointRecord`] row: epoch, source cursor, watermark and
//!   the sink write status.
//!
//! - The input files consumed by the batch, so a restarted directory
//!   source does not re-read them.
//!
//! - The accumulators changed by the batch, and deletes for the ones
//!   evicted by it. Accumulators of windows that are still open must
//!   survive a restart or their partial aggregates would be lost once
//!   the cursor moves past their files.
//!
//! - The windows finalized by the batch.
//!
//! The checkpoint is only written after every sink acknowledged the
//! batch. If the process dies in between, the next run resumes from
//! the previous checkpoint, re-polls the same files and re-upserts the
//! same rows.
//!
//! The consumed-file log keeps one row per input file for the life of
//! the query; only checkpoint rows are GCed. A store that has seen
//! millions of files should be started fresh under a new query name.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::Classify;
use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::inputs::SourceCursor;
use crate::record::GroupKey;
use crate::state::Accumulator;
use crate::window::Watermark;
use crate::window::Window;

/// Did the sinks take any rows in the checkpointed batch?
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkStatus {
    /// All sinks acknowledged the batch's rows.
    Acknowledged,
    /// The batch emitted no rows.
    NothingToWrite,
}

impl SinkStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SinkStatus::Acknowledged => "acknowledged",
            SinkStatus::NothingToWrite => "nothing_to_write",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "acknowledged" => Some(SinkStatus::Acknowledged),
            "nothing_to_write" => Some(SinkStatus::NothingToWrite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub epoch: u64,
    pub cursor: SourceCursor,
    pub watermark: Watermark,
    pub sink_status: SinkStatus,
}

/// Everything needed to resume a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    pub checkpoint: CheckpointRecord,
    /// Input files consumed so far, in consumption order.
    pub files: Vec<PathBuf>,
    /// Accumulators of windows that were still open.
    pub accs: Vec<(Window, GroupKey, Accumulator)>,
    /// Windows finalized within the retained checkpoints.
    pub emitted: BTreeSet<Window>,
}

/// Side effects of one batch to persist atomically.
#[derive(Debug, Clone)]
pub struct Commit<'a> {
    pub record: CheckpointRecord,
    /// Files consumed by this batch with their discovery sequence
    /// numbers.
    pub files: Vec<(u64, &'a Path)>,
    pub upserts: Vec<(&'a Window, &'a GroupKey, &'a Accumulator)>,
    pub evicted: Vec<(&'a Window, &'a GroupKey)>,
    pub emitted: Vec<Window>,
}

/// Durable home of checkpoints.
pub trait CheckpointStore: Send {
    /// Latest checkpoint, or `None` to start fresh.
    fn load(&mut self) -> PipelineResult<Option<ResumeState>>;

    /// Persist one batch's checkpoint. All or nothing.
    fn commit(&mut self, commit: &Commit<'_>) -> PipelineResult<()>;
}

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE checkpoints ( \
                 committed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 query_name TEXT NOT NULL, \
                 epoch INTEGER NOT NULL CHECK (epoch > 0), \
                 cursor_seq INTEGER NOT NULL CHECK (cursor_seq >= 0), \
                 watermark INTEGER, \
                 sink_status TEXT NOT NULL, \
                 PRIMARY KEY (query_name, epoch) \
                 ) STRICT",
            ),
            M::up(
                "CREATE TABLE files ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 query_name TEXT NOT NULL, \
                 seq INTEGER NOT NULL CHECK (seq > 0), \
                 path TEXT NOT NULL, \
                 epoch INTEGER NOT NULL, \
                 PRIMARY KEY (query_name, seq) \
                 ) STRICT",
            ),
            // Live accumulators only. Rows are deleted as their
            // window is evicted.
            M::up(
                "CREATE TABLE accs ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 query_name TEXT NOT NULL, \
                 window_start INTEGER NOT NULL, \
                 window_end INTEGER NOT NULL, \
                 city TEXT NOT NULL, \
                 wthr_date TEXT NOT NULL, \
                 ser_acc TEXT NOT NULL, \
                 epoch INTEGER NOT NULL, \
                 PRIMARY KEY (query_name, window_start, window_end, city, wthr_date) \
                 ) STRICT",
            ),
            M::up(
                "CREATE TABLE emitted ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 query_name TEXT NOT NULL, \
                 window_start INTEGER NOT NULL, \
                 window_end INTEGER NOT NULL, \
                 epoch INTEGER NOT NULL, \
                 PRIMARY KEY (query_name, window_start, window_end) \
                 ) STRICT",
            ),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas and schema. Run this on each
/// connection.
fn setup_conn(
    conn: &mut Connection,
    busy_timeout: Duration,
    migrations: &Migrations<'static>,
) -> rusqlite_migration::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // A stuck writer on the other side of the file lock fails the
    // call after this long. Nothing bounds a hung read or fsync.
    conn.pragma_update(None, "busy_timeout", busy_timeout.as_millis() as i64)?;
    migrations.to_latest(conn)
}

/// Open (creating if needed) a SQLite DB, or an in-memory one when
/// `path` is `None`, and bring its schema up to date.
pub(crate) fn open_conn(
    path: Option<&Path>,
    busy_timeout: Duration,
    migrations: &Migrations<'static>,
) -> rusqlite_migration::Result<Connection> {
    let mut conn = match path {
        Some(path) => Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?,
        None => Connection::open_in_memory()?,
    };
    setup_conn(&mut conn, busy_timeout, migrations)?;
    Ok(conn)
}

/// Number of checkpoint rows kept per query; older ones are GCed.
const RETAINED_CHECKPOINTS: u64 = 3;

/// Checkpoint store in a SQLite file.
pub struct SqliteCheckpointStore {
    conn: Connection,
    query_name: String,
}

impl SqliteCheckpointStore {
    pub fn open(file: &Path, query_name: &str, busy_timeout: Duration) -> PipelineResult<Self> {
        tracing::info!("Opening checkpoint store at {file:?}");
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir)
                .checkpoint_failure(&format!("can't create checkpoint dir {dir:?}"))?;
        }
        let conn = open_conn(Some(file), busy_timeout, get_migrations())
            .checkpoint_failure(&format!("can't open checkpoint DB {file:?}"))?;
        Ok(Self {
            conn,
            query_name: query_name.to_string(),
        })
    }

    pub fn in_memory(query_name: &str) -> PipelineResult<Self> {
        let conn = open_conn(None, Duration::from_secs(5), get_migrations())
            .checkpoint_failure("can't open in-memory checkpoint DB")?;
        Ok(Self {
            conn,
            query_name: query_name.to_string(),
        })
    }

    fn latest(&self) -> rusqlite::Result<Option<(i64, i64, Option<i64>, String)>> {
        self.conn
            .query_row(
                "SELECT epoch, cursor_seq, watermark, sink_status \
                 FROM checkpoints \
                 WHERE query_name = ?1 \
                 ORDER BY epoch DESC \
                 LIMIT 1",
                (&self.query_name,),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
    }

    fn files(&self) -> rusqlite::Result<Vec<PathBuf>> {
        self.conn
            .prepare(
                "SELECT path \
                 FROM files \
                 WHERE query_name = ?1 \
                 ORDER BY seq",
            )?
            .query_map((&self.query_name,), |row| {
                row.get::<_, String>(0).map(PathBuf::from)
            })?
            // We have to collect so that we don't need to retain a
            // reference to the connection in the iterator.
            .collect()
    }

    fn accs(&self) -> rusqlite::Result<Vec<(i64, i64, String, String, String)>> {
        self.conn
            .prepare(
                "SELECT window_start, window_end, city, wthr_date, ser_acc \
                 FROM accs \
                 WHERE query_name = ?1 \
                 ORDER BY window_start, window_end, city, wthr_date",
            )?
            .query_map((&self.query_name,), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect()
    }

    fn emitted(&self) -> rusqlite::Result<Vec<(i64, i64)>> {
        self.conn
            .prepare(
                "SELECT window_start, window_end \
                 FROM emitted \
                 WHERE query_name = ?1",
            )?
            .query_map((&self.query_name,), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect()
    }

    /// Drop every row of this query so the next commit starts from a
    /// clean slate.
    fn reset(&mut self) -> rusqlite::Result<()> {
        let txn = self.conn.transaction()?;
        for table in ["checkpoints", "files", "accs", "emitted"] {
            txn.execute(
                &format!("DELETE FROM {table} WHERE query_name = ?1"),
                (&self.query_name,),
            )?;
        }
        txn.commit()
    }
}

/// Turn raw rows into a [`ResumeState`]; any unparseable value is
/// reported as a string.
fn parse_resume(
    latest: (i64, i64, Option<i64>, String),
    files: Vec<PathBuf>,
    accs: Vec<(i64, i64, String, String, String)>,
    emitted: Vec<(i64, i64)>,
) -> Result<ResumeState, String> {
    let (epoch, cursor_seq, watermark, sink_status) = latest;
    let checkpoint = CheckpointRecord {
        epoch: u64::try_from(epoch).map_err(|_err| format!("bad epoch {epoch}"))?,
        cursor: SourceCursor {
            seq: u64::try_from(cursor_seq).map_err(|_err| format!("bad cursor {cursor_seq}"))?,
        },
        watermark: Watermark::from_millis(watermark)
            .ok_or_else(|| format!("bad watermark {watermark:?}"))?,
        sink_status: SinkStatus::parse(&sink_status)
            .ok_or_else(|| format!("bad sink status {sink_status:?}"))?,
    };
    let accs = accs
        .into_iter()
        .map(|(start, end, city, wthr_date, ser_acc)| {
            let window = Window::from_millis(start, end)
                .ok_or_else(|| format!("bad window [{start}, {end})"))?;
            let acc: Accumulator = serde_json::from_str(&ser_acc)
                .map_err(|err| format!("bad accumulator for {city:?} in {window:?}: {err}"))?;
            Ok((window, GroupKey::new(city, wthr_date), acc))
        })
        .collect::<Result<_, String>>()?;
    let emitted = emitted
        .into_iter()
        .map(|(start, end)| {
            Window::from_millis(start, end).ok_or_else(|| format!("bad window [{start}, {end})"))
        })
        .collect::<Result<_, String>>()?;
    Ok(ResumeState {
        checkpoint,
        files,
        accs,
        emitted,
    })
}

impl CheckpointStore for SqliteCheckpointStore {
    #[tracing::instrument(name = "checkpoint_load", skip_all, fields(query_name = %self.query_name))]
    fn load(&mut self) -> PipelineResult<Option<ResumeState>> {
        let Some(latest) = self
            .latest()
            .checkpoint_failure("error reading latest checkpoint")?
        else {
            tracing::info!("No checkpoint found; starting fresh");
            return Ok(None);
        };
        let files = self.files().checkpoint_failure("error reading committed files")?;
        let accs = self.accs().checkpoint_failure("error reading accumulators")?;
        let emitted = self.emitted().checkpoint_failure("error reading emitted windows")?;

        match parse_resume(latest, files, accs, emitted) {
            Ok(resume) => {
                tracing::info!(
                    "Resuming after epoch {} at cursor {} and watermark {} with {} open accumulators",
                    resume.checkpoint.epoch,
                    resume.checkpoint.cursor.seq,
                    resume.checkpoint.watermark,
                    resume.accs.len()
                );
                Ok(Some(resume))
            }
            Err(reason) => {
                tracing::error!("Checkpoint is unreadable ({reason}); discarding it and starting fresh");
                self.reset()
                    .checkpoint_failure("error discarding unreadable checkpoint")?;
                Ok(None)
            }
        }
    }

    #[tracing::instrument(
        name = "checkpoint_commit",
        skip_all,
        fields(query_name = %self.query_name, epoch = commit.record.epoch)
    )]
    fn commit(&mut self, commit: &Commit<'_>) -> PipelineResult<()> {
        let query_name = self.query_name.clone();
        let record = &commit.record;
        let epoch = record.epoch as i64;

        let txn = self
            .conn
            .transaction()
            .checkpoint_failure("error starting checkpoint transaction")?;
        // Do not upsert because we should never see an epoch twice.
        txn.execute(
            "INSERT INTO checkpoints (query_name, epoch, cursor_seq, watermark, sink_status) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                &query_name,
                epoch,
                record.cursor.seq as i64,
                record.watermark.to_millis(),
                record.sink_status.as_str(),
            ),
        )
        .checkpoint_failure("error writing checkpoint row")?;

        for (seq, path) in &commit.files {
            tracing::trace!("Committing file {seq} {path:?}");
            txn.execute(
                "INSERT INTO files (query_name, seq, path, epoch) \
                 VALUES (?1, ?2, ?3, ?4)",
                (&query_name, *seq as i64, path.to_string_lossy(), epoch),
            )
            .checkpoint_failure("error writing committed file")?;
        }

        for (window, key, acc) in &commit.upserts {
            let (start, end) = window.to_millis();
            let ser_acc =
                serde_json::to_string(acc).checkpoint_failure("error serializing accumulator")?;
            txn.execute(
                "INSERT INTO accs (query_name, window_start, window_end, city, wthr_date, \
                 ser_acc, epoch) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (query_name, window_start, window_end, city, wthr_date) DO UPDATE \
                 SET ser_acc = EXCLUDED.ser_acc, epoch = EXCLUDED.epoch",
                (
                    &query_name,
                    start,
                    end,
                    &key.city,
                    &key.wthr_date,
                    ser_acc,
                    epoch,
                ),
            )
            .checkpoint_failure("error writing accumulator")?;
        }

        for (window, key) in &commit.evicted {
            let (start, end) = window.to_millis();
            txn.execute(
                "DELETE FROM accs \
                 WHERE query_name = ?1 AND window_start = ?2 AND window_end = ?3 \
                 AND city = ?4 AND wthr_date = ?5",
                (&query_name, start, end, &key.city, &key.wthr_date),
            )
            .checkpoint_failure("error deleting evicted accumulator")?;
        }

        for window in &commit.emitted {
            let (start, end) = window.to_millis();
            txn.execute(
                "INSERT INTO emitted (query_name, window_start, window_end, epoch) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (query_name, window_start, window_end) DO NOTHING",
                (&query_name, start, end, epoch),
            )
            .checkpoint_failure("error writing emitted window")?;
        }

        // Keep the last few checkpoints around for inspection.
        let gc_before = epoch - RETAINED_CHECKPOINTS as i64;
        if gc_before > 0 {
            tracing::trace!("GCing checkpoints up to epoch {gc_before}");
            txn.execute(
                "DELETE FROM checkpoints WHERE query_name = ?1 AND epoch <= ?2",
                (&query_name, gc_before),
            )
            .checkpoint_failure("error GCing checkpoints")?;
            txn.execute(
                "DELETE FROM emitted WHERE query_name = ?1 AND epoch <= ?2",
                (&query_name, gc_before),
            )
            .checkpoint_failure("error GCing emitted windows")?;
        }

        txn.commit()
            .checkpoint_failure("error committing checkpoint")?;
        tracing::debug!(
            "Committed epoch {} at cursor {} and watermark {}",
            record.epoch,
            record.cursor.seq,
            record.watermark
        );
        Ok(())
    }
}
