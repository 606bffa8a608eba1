//! Mergeable approximate distinct counting.
//!
//! A HyperLogLog sketch over [`seahash`] hashes. Small cardinalities
//! are kept exactly as a set of hashes ("sparse"); once that set
//! would use more memory than the registers it switches to the
//! "dense" register array for good.
//!
//! Merging is a set union while both sides are sparse and a
//! register-wise max otherwise. Both are associative and
//! commutative, and the sparse/dense decision only depends on the
//! union of hashes seen, so any merge order yields an equal sketch.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::PipelineError;
use crate::errors::PipelineResult;

/// Fixed seeds so hashes are stable across restarts and versions.
const SEEDS: (u64, u64, u64, u64) = (
    0x16f1_1fe8_9b0d_677c,
    0xb480_a793_d8e6_c86c,
    0x6fe2_e5aa_f078_ebc9,
    0x14f9_94a4_c525_9381,
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Repr {
    Sparse(BTreeSet<u64>),
    Dense(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HyperLogLog {
    precision: u8,
    repr: Repr,
}

impl HyperLogLog {
    /// `precision` is the number of index bits; `2^precision`
    /// registers give a relative standard deviation of about
    /// `1.04 / sqrt(2^precision)`.
    pub fn new(precision: u8) -> Self {
        Self {
            precision: precision.clamp(4, 16),
            repr: Repr::Sparse(BTreeSet::new()),
        }
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    fn num_registers(&self) -> usize {
        1 << self.precision
    }

    fn sparse_limit(&self) -> usize {
        self.num_registers() / 8
    }

    pub fn insert(&mut self, item: &str) {
        let hash = hash(item);
        match &mut self.repr {
            Repr::Sparse(hashes) => {
                hashes.insert(hash);
                if hashes.len() > self.sparse_limit() {
                    self.densify();
                }
            }
            Repr::Dense(registers) => update_register(registers, self.precision, hash),
        }
    }

    pub fn merge(&mut self, other: &HyperLogLog) -> PipelineResult<()> {
        if self.precision != other.precision {
            return Err(PipelineError::StoreCorruption(format!(
                "can't merge distinct-count sketches of precision {} and {}",
                self.precision, other.precision
            )));
        }
        match (&mut self.repr, &other.repr) {
            (Repr::Sparse(ours), Repr::Sparse(theirs)) => {
                ours.extend(theirs.iter().copied());
                if ours.len() > self.sparse_limit() {
                    self.densify();
                }
            }
            (Repr::Dense(ours), Repr::Sparse(theirs)) => {
                for hash in theirs {
                    update_register(ours, self.precision, *hash);
                }
            }
            (Repr::Sparse(_), Repr::Dense(_)) => {
                self.densify();
                self.merge(other)?;
            }
            (Repr::Dense(ours), Repr::Dense(theirs)) => {
                if ours.len() != theirs.len() {
                    return Err(PipelineError::StoreCorruption(format!(
                        "sketch register count mismatch: {} vs {}",
                        ours.len(),
                        theirs.len()
                    )));
                }
                for (ours, theirs) in ours.iter_mut().zip(theirs) {
                    *ours = (*ours).max(*theirs);
                }
            }
        }
        Ok(())
    }

    fn densify(&mut self) {
        if let Repr::Sparse(hashes) = &self.repr {
            let mut registers = vec![0; self.num_registers()];
            for hash in hashes {
                update_register(&mut registers, self.precision, *hash);
            }
            self.repr = Repr::Dense(registers);
        }
    }

    pub fn is_dense(&self) -> bool {
        matches!(self.repr, Repr::Dense(_))
    }

    /// Estimated number of distinct items inserted.
    pub fn estimate(&self) -> u64 {
        match &self.repr {
            Repr::Sparse(hashes) => hashes.len() as u64,
            Repr::Dense(registers) => {
                let m = registers.len() as f64;
                let alpha = match registers.len() {
                    16 => 0.673,
                    32 => 0.697,
                    64 => 0.709,
                    _ => 0.7213 / (1.0 + 1.079 / m),
                };
                let sum: f64 = registers
                    .iter()
                    .map(|register| 2f64.powi(-(*register as i32)))
                    .sum();
                let raw = alpha * m * m / sum;
                let zeros = registers.iter().filter(|register| **register == 0).count();
                let estimate = if raw <= 2.5 * m && zeros > 0 {
                    // Linear counting is more accurate in the small
                    // range.
                    m * (m / zeros as f64).ln()
                } else {
                    raw
                };
                estimate.round() as u64
            }
        }
    }
}

fn hash(item: &str) -> u64 {
    seahash::hash_seeded(item.as_bytes(), SEEDS.0, SEEDS.1, SEEDS.2, SEEDS.3)
}

fn update_register(registers: &mut [u8], precision: u8, hash: u64) {
    let index = (hash >> (64 - precision)) as usize;
    let rest = hash << precision;
    let max_rank = 64 - precision as u32 + 1;
    let rank = (rest.leading_zeros() + 1).min(max_rank) as u8;
    if registers[index] < rank {
        registers[index] = rank;
    }
}
