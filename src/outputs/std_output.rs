use std::io::Write;

use crate::errors::Classify;
use crate::errors::PipelineResult;

use super::Sink;
use super::StatRow;

/// Print output rows to standard out, one JSON object per line.
#[derive(Debug, Default)]
pub struct StdOutput {}

impl StdOutput {
    pub fn new() -> Self {
        Self {}
    }
}

impl Sink for StdOutput {
    fn name(&self) -> &str {
        "stdout"
    }

    fn write_batch(&mut self, epoch: u64, rows: &[StatRow]) -> PipelineResult<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for row in rows {
            let line = serde_json::to_string(row).sink_failure("error serializing row")?;
            writeln!(out, "{{\"epoch\":{epoch},\"row\":{line}}}")
                .sink_failure("error writing to stdout")?;
        }
        out.flush().sink_failure("error flushing stdout")
    }
}
