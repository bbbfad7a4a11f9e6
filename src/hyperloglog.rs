//! Dense HyperLogLog cardinality estimator.
//!
//! 2^14 registers of 6 bits each, matching the layout Redis uses for dense
//! HyperLogLogs. Standard error is about 0.81%. Small cardinalities fall back to
//! linear counting, so a sketch holding a handful of members reports them exactly.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const PRECISION: u32 = 14;
const REGISTERS: usize = 1 << PRECISION;
const REGISTER_MAX: u8 = 63;
// Bits left over once the register index is taken from a 64-bit hash.
const RANK_BITS: u32 = 64 - PRECISION;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    registers: Vec<u8>,
}

impl HyperLogLog {
    pub fn new() -> Self {
        HyperLogLog {
            registers: vec![0; REGISTERS],
        }
    }

    /// Adds `element`. Returns true if a register changed, i.e. the estimate may have moved.
    pub fn insert(&mut self, element: &[u8]) -> bool {
        let hash = hash64(element);
        let index = (hash & (REGISTERS as u64 - 1)) as usize;
        let rank = Self::rank(hash >> PRECISION);

        if rank > self.registers[index] {
            self.registers[index] = rank;
            true
        } else {
            false
        }
    }

    // Position of the first set bit within the remaining RANK_BITS, 1-based.
    fn rank(remaining: u64) -> u8 {
        let rank = if remaining == 0 {
            RANK_BITS + 1
        } else {
            remaining.leading_zeros() - PRECISION + 1
        };
        (rank as u8).min(REGISTER_MAX)
    }

    pub fn estimate(&self) -> u64 {
        let m = REGISTERS as f64;
        let mut inverse_sum = 0.0;
        let mut zeros = 0usize;
        for &register in &self.registers {
            if register == 0 {
                zeros += 1;
            }
            inverse_sum += 1.0 / (1u64 << register) as f64;
        }

        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let raw = alpha * m * m / inverse_sum;

        if raw <= 2.5 * m && zeros > 0 {
            let linear = m * (m / zeros as f64).ln();
            return linear.round() as u64;
        }

        let two_pow_32 = (1u64 << 32) as f64;
        if raw <= two_pow_32 / 30.0 {
            raw.round() as u64
        } else {
            (-two_pow_32 * (1.0 - raw / two_pow_32).ln()).round() as u64
        }
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

fn hash64(data: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}
