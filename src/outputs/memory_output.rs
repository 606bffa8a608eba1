use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

use super::RowKey;
use super::Sink;
use super::StatRow;

/// In-memory, queryable copy of the emitted rows.
///
/// Clones share the same buffer, so keep one handle for querying and
/// give another to the scheduler. Nothing is persisted; the buffer
/// starts empty on every restart.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<BTreeMap<RowKey, StatRow>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PipelineResult<MutexGuard<'_, BTreeMap<RowKey, StatRow>>> {
        self.rows
            .lock()
            .map_err(|_err| PipelineError::SinkWriteFailure("memory sink lock poisoned".into()))
    }

    /// All rows ordered by window then group key.
    pub fn rows(&self) -> Vec<StatRow> {
        self.lock()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rows_for_city(&self, city: &str) -> Vec<StatRow> {
        self.lock()
            .map(|rows| {
                rows.values()
                    .filter(|row| row.city == city)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, key: &RowKey) -> Option<StatRow> {
        self.lock().ok().and_then(|rows| rows.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cities by their largest distinct hotel count in any row,
    /// biggest first.
    pub fn top_cities(&self, limit: usize) -> Vec<(String, u64)> {
        let mut biggest: BTreeMap<String, u64> = BTreeMap::new();
        for row in self.rows() {
            let count = biggest.entry(row.city).or_default();
            *count = (*count).max(row.distinct_hotel_count);
        }
        let mut cities: Vec<(String, u64)> = biggest.into_iter().collect();
        cities.sort_by(|(a_city, a_count), (b_city, b_count)| {
            b_count.cmp(a_count).then_with(|| a_city.cmp(b_city))
        });
        cities.truncate(limit);
        cities
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write_batch(&mut self, _epoch: u64, rows: &[StatRow]) -> PipelineResult<()> {
        let mut buffer = self.lock()?;
        for row in rows {
            buffer.insert(row.key(), row.clone());
        }
        Ok(())
    }
}
