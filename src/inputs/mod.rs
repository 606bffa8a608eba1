//! Internal code for input.
//!
//! Architecture
//! ------------
//!
//! Input is based around the core trait of [`Source`]. The scheduler
//! polls it once per trigger with the last committed
//! [`SourceCursor`] and gets back the records of every file discovered
//! since, plus the cursor to commit once the batch is durable.
//!
//! Polling is side-effect free: polling twice from the same cursor
//! (e.g. when a batch is retried) returns the same files again. Only
//! [`Source::mark_committed`], called after the checkpoint is written,
//! moves a source's notion of "already consumed" forward, and
//! [`Source::resume`] resets it to what the checkpoint says.

use std::path::PathBuf;

use crate::errors::PipelineResult;
use crate::record::Record;

pub(crate) mod decode;
pub(crate) mod directory;
pub(crate) mod testing;

pub use self::decode::decode_file;
pub use self::directory::DirectorySource;
pub use self::testing::TestingSource;

/// Marks "everything consumed so far": the sequence number of the last
/// discovered file. `0` is the beginning.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceCursor {
    pub seq: u64,
}

/// A file consumed by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Discovery sequence number, consecutive from the polled cursor.
    pub seq: u64,
    pub path: PathBuf,
    /// Records decoded from this file; `None` if it was skipped.
    pub records: Option<usize>,
}

/// Result of one [`Source::poll`].
#[derive(Debug, Default)]
pub struct Poll {
    pub records: Vec<Record>,
    pub new_cursor: SourceCursor,
    pub files: Vec<DiscoveredFile>,
    /// Files that failed to decode.
    pub skipped: usize,
}

impl Poll {
    /// Nothing new was discovered.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.records.is_empty()
    }
}

pub trait Source: Send {
    /// Discover and decode everything after `cursor`.
    ///
    /// Fails with [`crate::errors::PipelineError::SourceUnavailable`]
    /// if the watched location can't be read.
    fn poll(&mut self, cursor: &SourceCursor) -> PipelineResult<Poll>;

    /// The given files are now part of a committed checkpoint.
    fn mark_committed(&mut self, _files: &[DiscoveredFile]) {}

    /// Forget any progress not in `committed`, the files of the
    /// checkpoint being resumed from.
    fn resume(&mut self, _committed: &[PathBuf]) {}
}
