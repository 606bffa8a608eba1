//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is built once at startup (from a JSON file,
//! CLI overrides, or directly in code) and handed to the scheduler.
//! Nothing reads configuration from ambient process state after that.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

/// Which rows a batch publishes to the sinks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Only rows of windows finalized in this batch.
    #[default]
    Append,
    /// Every row changed in this batch, plus finalized ones.
    Complete,
}

impl std::str::FromStr for OutputMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "append" => Ok(OutputMode::Append),
            "complete" => Ok(OutputMode::Complete),
            other => Err(PipelineError::Config(format!(
                "unknown output mode {other:?}; expected `append` or `complete`"
            ))),
        }
    }
}

/// Plain all-time group-by or watermarked sliding windows. The two
/// are mutually exclusive pipeline configurations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Windowed,
    Plain,
}

/// Where a record's event time comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTime {
    /// Modification time of the file the record was decoded from.
    /// Stable across replays.
    #[default]
    FileModified,
    /// Wall clock at decode time.
    Ingestion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_query_name")]
    pub query_name: String,
    pub input_path: PathBuf,
    pub checkpoint_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(
        default = "default_window_length",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub window_length: Duration,
    #[serde(
        default = "default_slide_interval",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub slide_interval: Duration,
    #[serde(
        default = "default_lateness_bound",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub lateness_bound: Duration,
    #[serde(
        default = "default_trigger_interval",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub trigger_interval: Duration,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default)]
    pub event_time: EventTime,
    #[serde(default)]
    pub max_files_per_trigger: Option<usize>,
    #[serde(default = "default_distinct_precision")]
    pub distinct_precision: u8,
    /// Deadline for a directory poll, checked between files, and the
    /// SQLite busy timeout. A single hung read or fsync is not bounded.
    #[serde(
        default = "default_io_timeout",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub io_timeout: Duration,
    #[serde(
        default = "default_max_backoff",
        deserialize_with = "de_duration",
        serialize_with = "ser_duration"
    )]
    pub max_backoff: Duration,
    #[serde(default)]
    pub console_output: bool,
    #[serde(default)]
    pub api_port: Option<u16>,
}

fn default_query_name() -> String {
    "hotel_statistics".to_string()
}

fn default_window_length() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_slide_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_lateness_bound() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_trigger_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_distinct_precision() -> u8 {
    9
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(5 * 60)
}

impl PipelineConfig {
    /// Config with every option at its default.
    pub fn new(input_path: impl Into<PathBuf>, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            query_name: default_query_name(),
            input_path: input_path.into(),
            checkpoint_path: checkpoint_path.into(),
            output_path: None,
            aggregation: Aggregation::default(),
            window_length: default_window_length(),
            slide_interval: default_slide_interval(),
            lateness_bound: default_lateness_bound(),
            trigger_interval: default_trigger_interval(),
            output_mode: OutputMode::default(),
            event_time: EventTime::default(),
            max_files_per_trigger: None,
            distinct_precision: default_distinct_precision(),
            io_timeout: default_io_timeout(),
            max_backoff: default_max_backoff(),
            console_output: false,
            api_port: None,
        }
    }

    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| PipelineError::Config(format!("error reading {path:?}: {err}")))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> PipelineResult<Self> {
        serde_json::from_str(text)
            .map_err(|err| PipelineError::Config(format!("error parsing config: {err}")))
    }

    /// Reject configurations the engine can't run.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.query_name.is_empty() {
            return Err(PipelineError::Config("query_name must not be empty".into()));
        }
        if self.trigger_interval.is_zero() {
            return Err(PipelineError::Config(
                "trigger_interval must be positive".into(),
            ));
        }
        if !(4..=16).contains(&self.distinct_precision) {
            return Err(PipelineError::Config(format!(
                "distinct_precision must be in 4..=16, got {}",
                self.distinct_precision
            )));
        }
        if self.max_files_per_trigger == Some(0) {
            return Err(PipelineError::Config(
                "max_files_per_trigger must be positive".into(),
            ));
        }
        match self.aggregation {
            Aggregation::Windowed => {
                if self.window_length.is_zero() {
                    return Err(PipelineError::Config("window_length must be positive".into()));
                }
                if self.slide_interval.is_zero() {
                    return Err(PipelineError::Config(
                        "slide_interval must be positive".into(),
                    ));
                }
                if self.slide_interval > self.window_length {
                    return Err(PipelineError::Config(format!(
                        "slide_interval ({:?}) must not exceed window_length ({:?})",
                        self.slide_interval, self.window_length
                    )));
                }
                // Window math is done on whole milliseconds.
                if self.window_length.subsec_nanos() % 1_000_000 != 0
                    || self.slide_interval.subsec_nanos() % 1_000_000 != 0
                {
                    return Err(PipelineError::Config(
                        "window_length and slide_interval must be whole milliseconds".into(),
                    ));
                }
            }
            Aggregation::Plain => {
                if self.output_mode == OutputMode::Append {
                    return Err(PipelineError::Config(
                        "plain aggregation never finalizes rows; use output_mode `complete`"
                            .into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// SQLite file holding this query's checkpoints.
    pub fn checkpoint_file(&self) -> PathBuf {
        self.checkpoint_path
            .join(format!("{}.checkpoint.sqlite3", self.query_name))
    }
}

/// Parse durations like `"10 seconds"`, `"2 minutes"`, `"500ms"` or
/// `"1h"`.
pub fn parse_duration(text: &str) -> PipelineResult<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (num, unit) = text.split_at(split);
    let num: u64 = num
        .parse()
        .map_err(|_err| PipelineError::Config(format!("invalid duration {text:?}")))?;
    let unit_secs = match unit.trim().to_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => return Ok(Duration::from_millis(num)),
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 60 * 60,
        "d" | "day" | "days" => 24 * 60 * 60,
        other => {
            return Err(PipelineError::Config(format!(
                "unknown duration unit {other:?} in {text:?}"
            )))
        }
    };
    num.checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| PipelineError::Config(format!("duration {text:?} overflows")))
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn ser_duration<S>(dur: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{}ms", dur.as_millis()))
}
