//! Error taxonomy for the pipeline.
//!
//! Every failure that crosses a component boundary is classified into
//! one of the [`PipelineError`] kinds. The scheduler only looks at
//! [`PipelineError::is_fatal`] to decide between "abort the batch and
//! retry next cycle" and "stop and surface to the operator".

use std::path::PathBuf;

/// Result type used in the crate that holds a [`PipelineError`].
pub type PipelineResult<T> = Result<T, PipelineError>;

/// A single input file could not be decoded into records.
///
/// This is never fatal: the source logs it, counts it, and skips the
/// file.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unable to decode {path:?}: {reason}")]
pub struct DecodeError {
    pub path: PathBuf,
    pub reason: String,
}

impl DecodeError {
    pub(crate) fn new(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The watched location could not be listed or read. Retryable.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A file could not be decoded. Skipped by the source.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The state store is in an inconsistent state. Fatal.
    #[error("state store corruption: {0}")]
    StoreCorruption(String),

    /// A sink did not acknowledge a write. Retryable.
    #[error("sink write failure: {0}")]
    SinkWriteFailure(String),

    /// The checkpoint could not be durably recorded. Retryable.
    #[error("checkpoint write failure: {0}")]
    CheckpointWriteFailure(String),

    /// Invalid configuration. Only raised before the scheduler starts.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Does this error require operator intervention?
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::StoreCorruption(_) | PipelineError::Config(_)
        )
    }

    /// Can the batch that raised this just be retried next cycle?
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Short stable name for this kind, used as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable(_) => "source_unavailable",
            PipelineError::Decode(_) => "decode",
            PipelineError::StoreCorruption(_) => "store_corruption",
            PipelineError::SinkWriteFailure(_) => "sink_write_failure",
            PipelineError::CheckpointWriteFailure(_) => "checkpoint_write_failure",
            PipelineError::Config(_) => "config",
        }
    }
}

/// Extension trait to classify foreign errors at a component
/// boundary.
///
/// Example:
///     fs::read_dir(path).source_unavailable("error listing input dir")?;
pub(crate) trait Classify<T> {
    fn source_unavailable(self, msg: &str) -> PipelineResult<T>;
    fn sink_failure(self, msg: &str) -> PipelineResult<T>;
    fn checkpoint_failure(self, msg: &str) -> PipelineResult<T>;
    fn corruption(self, msg: &str) -> PipelineResult<T>;
}

impl<T, E> Classify<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn source_unavailable(self, msg: &str) -> PipelineResult<T> {
        self.map_err(|err| PipelineError::SourceUnavailable(format!("{msg}: {err}")))
    }

    fn sink_failure(self, msg: &str) -> PipelineResult<T> {
        self.map_err(|err| PipelineError::SinkWriteFailure(format!("{msg}: {err}")))
    }

    fn checkpoint_failure(self, msg: &str) -> PipelineResult<T> {
        self.map_err(|err| PipelineError::CheckpointWriteFailure(format!("{msg}: {err}")))
    }

    fn corruption(self, msg: &str) -> PipelineResult<T> {
        self.map_err(|err| PipelineError::StoreCorruption(format!("{msg}: {err}")))
    }
}

#[test]
fn only_corruption_and_config_are_fatal() {
    assert!(PipelineError::StoreCorruption("x".into()).is_fatal());
    assert!(PipelineError::Config("x".into()).is_fatal());
    assert!(PipelineError::SourceUnavailable("x".into()).is_retryable());
    assert!(PipelineError::SinkWriteFailure("x".into()).is_retryable());
    assert!(PipelineError::CheckpointWriteFailure("x".into()).is_retryable());
    assert!(PipelineError::Decode(DecodeError::new("a.parquet", "bad")).is_retryable());
}

#[test]
fn classify_wraps_message() {
    let res: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no such dir",
    ));
    let err = res.source_unavailable("error listing input").unwrap_err();
    assert_eq!(
        err.to_string(),
        "source unavailable: error listing input: no such dir"
    );
    assert_eq!(err.kind(), "source_unavailable");
}
