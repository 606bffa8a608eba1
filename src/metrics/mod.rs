//! Prometheus metrics through the OpenTelemetry meter API.
//!
//! [`initialize_metrics`] installs a global meter provider exporting
//! into the default Prometheus registry; [`render`] dumps that
//! registry in the text exposition format for `GET /metrics`. Without
//! initialization the instruments are no-ops.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::sdk::metrics::Aggregation;
use opentelemetry::sdk::metrics::Instrument;
use opentelemetry::sdk::metrics::MeterProvider;
use opentelemetry::sdk::metrics::Stream;
use opentelemetry::KeyValue;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> opentelemetry::metrics::Result<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("hotel_stats")
        .build()?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(opentelemetry_sdk::metrics::new_view(
            Instrument::new().name("*duration*"), // Must match histogram name
            Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                boundaries: vec![
                    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                    5.0, 7.5, 10.0, 30.0, 60.0,
                ],
                record_min_max: true,
            }),
        )?)
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Current values of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&default_registry().gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
}

/// Instruments of one query's scheduler.
pub(crate) struct PipelineMetrics {
    pub(crate) records_admitted: Counter<u64>,
    pub(crate) records_late: Counter<u64>,
    pub(crate) files_skipped: Counter<u64>,
    pub(crate) batches_committed: Counter<u64>,
    pub(crate) batches_aborted: Counter<u64>,
    pub(crate) rows_emitted: Counter<u64>,
    pub(crate) batch_duration: Histogram<f64>,
    pub(crate) labels: Vec<KeyValue>,
}

impl PipelineMetrics {
    pub(crate) fn new(query_name: &str) -> Self {
        let meter = global::meter("hotel_stats");
        Self {
            records_admitted: meter
                .u64_counter("records_admitted")
                .with_description("number of records merged into window state")
                .init(),
            records_late: meter
                .u64_counter("records_late")
                .with_description("number of records dropped for arriving after the watermark")
                .init(),
            files_skipped: meter
                .u64_counter("files_skipped")
                .with_description("number of input files that failed to decode")
                .init(),
            batches_committed: meter
                .u64_counter("batches_committed")
                .with_description("number of batches whose checkpoint was written")
                .init(),
            batches_aborted: meter
                .u64_counter("batches_aborted")
                .with_description("number of batches aborted and retried")
                .init(),
            rows_emitted: meter
                .u64_counter("rows_emitted")
                .with_description("number of rows written to the sinks")
                .init(),
            batch_duration: meter
                .f64_histogram("batch_duration_seconds")
                .with_description("duration of one batch from poll to checkpoint in seconds")
                .init(),
            labels: vec![KeyValue::new("query_name", query_name.to_string())],
        }
    }

    /// Labels plus the kind of error that aborted a batch.
    pub(crate) fn abort_labels(&self, kind: &'static str) -> Vec<KeyValue> {
        let mut labels = self.labels.clone();
        labels.push(KeyValue::new("error_kind", kind));
        labels
    }
}
