//! Incremental windowed aggregation of hotel weather observations.
//!
//! Files dropped into a watched directory are decoded into
//! [`record::Record`]s, assigned to sliding event-time windows, and
//! folded into per `(window, city, wthr_date)` accumulators. Windows
//! are finalized once the watermark passes their end plus the
//! lateness bound and upserted into a SQLite table. Progress is
//! checkpointed after every batch so a restarted query neither loses
//! nor double counts records.
//!
//! [`run::Scheduler`] is the root of all the action here.

pub mod config;
pub mod errors;
pub mod inputs;
pub mod metrics;
pub mod outputs;
pub mod record;
pub mod recovery;
pub mod run;
pub mod state;
pub mod tracing;
pub mod webserver;
pub mod window;

pub use crate::config::PipelineConfig;
pub use crate::errors::PipelineError;
pub use crate::errors::PipelineResult;
pub use crate::run::Scheduler;
pub use crate::run::ShutdownHandle;
