//! Square matrix-multiply problem description.

use crate::errors::{HarnessError, HarnessResult};
use serde::Serialize;

/// Bytes per f32 element.
pub const ELEMENT_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Immutable description of a `C[M,N] = A[M,K] * B[K,N]` workload and the
/// number of timed repetitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkloadDescriptor {
    m: u32,
    n: u32,
    k: u32,
    runs: u32,
}

impl WorkloadDescriptor {
    /// Creates a validated workload. Every dimension and the run count must be positive.
    pub fn new(m: u32, n: u32, k: u32, runs: u32) -> HarnessResult<Self> {
        for (field, value) in [("M", m), ("N", n), ("K", k), ("runs", runs)] {
            if value == 0 {
                return Err(HarnessError::InvalidWorkload { field, value });
            }
        }
        Ok(Self { m, n, k, runs })
    }

    /// Square workload with `M = N = K = size`.
    pub fn square(size: u32, runs: u32) -> HarnessResult<Self> {
        Self::new(size, size, size, runs)
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    pub fn runs(&self) -> u32 {
        self.runs
    }

    /// Element count of operand A (`M x K`).
    pub fn a_len(&self) -> usize {
        self.m as usize * self.k as usize
    }

    /// Element count of operand B (`K x N`).
    pub fn b_len(&self) -> usize {
        self.k as usize * self.n as usize
    }

    /// Element count of the result C (`M x N`).
    pub fn c_len(&self) -> usize {
        self.m as usize * self.n as usize
    }

    pub fn a_bytes(&self) -> u64 {
        self.a_len() as u64 * ELEMENT_BYTES
    }

    pub fn b_bytes(&self) -> u64 {
        self.b_len() as u64 * ELEMENT_BYTES
    }

    pub fn c_bytes(&self) -> u64 {
        self.c_len() as u64 * ELEMENT_BYTES
    }

    /// Size of the largest of the three operands in bytes.
    pub fn max_operand_bytes(&self) -> u64 {
        self.a_bytes().max(self.b_bytes()).max(self.c_bytes())
    }

    /// Floating point operations of one multiply (`2 * M * N * K`).
    pub fn flops(&self) -> f64 {
        2.0 * self.m as f64 * self.n as f64 * self.k as f64
    }
}
