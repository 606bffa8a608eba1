//! Internal code for tracing/logging.
//!
//! Logs go to stdout through a compact `fmt` layer. What is logged is
//! decided, in order, by:
//!
//! 1. The `HOTEL_STATS_LOG` env var, in `EnvFilter` syntax. E.g. to
//!    see this crate's debug logs and only errors from everything
//!    else:
//!        $ HOTEL_STATS_LOG="hotel_stats=debug,error" hotel-stats run ...
//!
//! 2. The `--log-level` given on the command line, applied to this
//!    crate only.
//!
//! 3. `info` for this crate.
//!
//! See tracing-subscriber's documentation:
//! https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

/// Env var overriding the log filter.
pub const LOG_ENV_VAR: &str = "HOTEL_STATS_LOG";

/// Target of every event logged by this crate.
const TARGET: &str = "hotel_stats";

fn get_log_level(level: Option<&str>) -> PipelineResult<LevelFilter> {
    match level.map(str::to_lowercase).as_deref() {
        Some("trace") => Ok(LevelFilter::TRACE),
        Some("debug") => Ok(LevelFilter::DEBUG),
        Some("info") | None => Ok(LevelFilter::INFO),
        Some("warn") => Ok(LevelFilter::WARN),
        Some("error") => Ok(LevelFilter::ERROR),
        Some("off") => Ok(LevelFilter::OFF),
        Some(level) => Err(PipelineError::Config(format!("wrong log level: {level}"))),
    }
}

fn log_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
}

/// Install the global subscriber.
pub fn setup(log_level: Option<&str>) -> PipelineResult<()> {
    match std::env::var(LOG_ENV_VAR) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives).map_err(|err| {
                PipelineError::Config(format!("invalid {LOG_ENV_VAR} {directives:?}: {err}"))
            })?;
            set_global_subscriber(Registry::default().with(log_layer().with_filter(filter)));
        }
        Err(_) => {
            let level = get_log_level(log_level)?;
            let filter = Targets::new().with_target(TARGET, level);
            set_global_subscriber(Registry::default().with(log_layer().with_filter(filter)));
        }
    }
    Ok(())
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // in tests that set it up more than once in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::INFO);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(PipelineError::Config(_))
    ));
}
