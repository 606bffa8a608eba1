//! Keyed aggregation state.
//!
//! The [`StateStore`] holds one [`Accumulator`] per live
//! `(window, group key)`. Records are merged on arrival; once the
//! watermark closes a window its accumulators are evicted (and
//! emitted) together.
//!
//! The store also remembers which keys changed since the last
//! commit, so the checkpoint only rewrites those and `complete` output
//! mode only emits those.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::Duration;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;
use crate::record::GroupKey;
use crate::record::Record;
use crate::window::Watermark;
use crate::window::Window;

pub(crate) mod accumulator;
pub(crate) mod sketch;

pub use self::accumulator::{Accumulator, FieldStats};
pub use self::sketch::HyperLogLog;

/// Identifies one accumulator.
pub type StateKey = (Window, GroupKey);

/// An accumulator removed by [`StateStore::evict`].
#[derive(Debug, Clone, PartialEq)]
pub struct Evicted {
    pub window: Window,
    pub key: GroupKey,
    pub acc: Accumulator,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    precision: u8,
    lateness: Duration,
    /// Watermark of the last eviction. Windows closed at this
    /// watermark are gone for good.
    watermark: Watermark,
    accs: BTreeMap<StateKey, Accumulator>,
    changed: BTreeSet<StateKey>,
}

impl StateStore {
    pub fn new(precision: u8, lateness: Duration) -> Self {
        Self {
            precision,
            lateness,
            watermark: Watermark::MIN,
            accs: BTreeMap::new(),
            changed: BTreeSet::new(),
        }
    }

    /// Rebuild from checkpointed accumulators.
    ///
    /// Every accumulator is validated; a single inconsistent one
    /// fails the whole restore.
    pub fn restore(
        precision: u8,
        lateness: Duration,
        watermark: Watermark,
        accs: impl IntoIterator<Item = (Window, GroupKey, Accumulator)>,
    ) -> PipelineResult<Self> {
        let mut store = Self::new(precision, lateness);
        store.watermark = watermark;
        for (window, key, acc) in accs {
            acc.validate()?;
            if acc.distinct_hotels.precision() != precision {
                return Err(PipelineError::StoreCorruption(format!(
                    "accumulator for {key:?} in {window:?} has sketch precision {}, \
                     configured {precision}",
                    acc.distinct_hotels.precision()
                )));
            }
            if store.accs.insert((window, key.clone()), acc).is_some() {
                return Err(PipelineError::StoreCorruption(format!(
                    "duplicate accumulator for {key:?} in {window:?}"
                )));
            }
        }
        tracing::debug!(
            "Restored {} accumulators at watermark {watermark}",
            store.accs.len()
        );
        Ok(store)
    }

    /// Look up or create the accumulator for `(window, key)` and fold
    /// the record into it.
    ///
    /// Returns `false` without touching anything if the window was
    /// already closed by a previous eviction. Deduplication of
    /// replayed records is the caller's job.
    pub fn merge(&mut self, window: Window, key: &GroupKey, record: &Record) -> PipelineResult<bool> {
        if window.is_closed(self.lateness, &self.watermark) {
            tracing::trace!("Not re-creating closed window {window:?} for {key:?}");
            return Ok(false);
        }
        let contribution = Accumulator::of(self.precision, record);
        let state_key = (window, key.clone());
        match self.accs.get_mut(&state_key) {
            Some(acc) => acc.merge(&contribution)?,
            None => {
                self.accs.insert(state_key.clone(), contribution);
            }
        }
        self.changed.insert(state_key);
        Ok(true)
    }

    /// Remove and return every accumulator whose window is closed at
    /// `watermark`, in `(window, key)` order.
    ///
    /// Never partial: all eligible accumulators are validated before
    /// any is removed, and on [`PipelineError::StoreCorruption`] the
    /// store is left untouched.
    pub fn evict(&mut self, watermark: Watermark) -> PipelineResult<Vec<Evicted>> {
        let closed: Vec<StateKey> = self
            .accs
            .iter()
            .filter(|((window, _key), _acc)| window.is_closed(self.lateness, &watermark))
            .map(|(state_key, acc)| {
                acc.validate().map_err(|err| {
                    PipelineError::StoreCorruption(format!(
                        "evicting {:?} in {:?}: {err}",
                        state_key.1, state_key.0
                    ))
                })?;
                Ok(state_key.clone())
            })
            .collect::<PipelineResult<_>>()?;

        self.watermark = self.watermark.max(watermark);
        let evicted: Vec<Evicted> = closed
            .into_iter()
            .filter_map(|state_key| {
                self.changed.remove(&state_key);
                self.accs.remove(&state_key).map(|acc| {
                    let (window, key) = state_key;
                    Evicted { window, key, acc }
                })
            })
            .collect();
        if !evicted.is_empty() {
            tracing::debug!(
                "Evicted {} accumulators at watermark {watermark}",
                evicted.len()
            );
        }
        Ok(evicted)
    }

    /// Accumulators changed since the last [`StateStore::clear_changes`].
    pub fn changes(&self) -> impl Iterator<Item = (&Window, &GroupKey, &Accumulator)> {
        self.changed.iter().filter_map(|state_key| {
            self.accs
                .get(state_key)
                .map(|acc| (&state_key.0, &state_key.1, acc))
        })
    }

    pub fn clear_changes(&mut self) {
        self.changed.clear();
    }

    pub fn get(&self, window: &Window, key: &GroupKey) -> Option<&Accumulator> {
        self.accs.get(&(*window, key.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Window, &GroupKey, &Accumulator)> {
        self.accs
            .iter()
            .map(|((window, key), acc)| (window, key, acc))
    }

    pub fn len(&self) -> usize {
        self.accs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accs.is_empty()
    }
}
