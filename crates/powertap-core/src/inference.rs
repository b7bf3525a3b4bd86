//! The workload whose power draw is being measured.
//!
//! The core only needs "run one inference, tell me when it finished". Model
//! loading and execution belong to whatever implements [`InferenceRunner`].

use std::hint::black_box;
use std::time::{Duration, Instant};

use crate::clock;
use crate::error::Result;
use crate::shutdown::HEARTBEAT;

/// Longest single synthetic inference. Callers check shutdown between runs,
/// so this bounds how late they notice it.
pub const MAX_WORK: Duration = HEARTBEAT;

pub trait InferenceRunner {
    fn name(&self) -> &str;

    /// Run one inference to completion and return its completion timestamp
    /// on the [`clock`] timeline.
    fn run_once(&mut self) -> Result<f64>;
}

/// CPU busy-work standing in for a model.
#[derive(Debug, Clone)]
pub struct SyntheticInference {
    work: Duration,
}

impl SyntheticInference {
    /// Each inference spins for `work`, capped at [`MAX_WORK`].
    pub fn new(work: Duration) -> Self {
        if work > MAX_WORK {
            log::debug!("synthetic work {work:?} capped at {MAX_WORK:?}");
        }
        Self {
            work: work.min(MAX_WORK),
        }
    }

    pub fn work(&self) -> Duration {
        self.work
    }
}

impl InferenceRunner for SyntheticInference {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn run_once(&mut self) -> Result<f64> {
        let start = Instant::now();
        let mut acc = 0x9E37_79B9_7F4A_7C15u64;
        while start.elapsed() < self.work {
            for _ in 0..1024 {
                acc = black_box(acc.rotate_left(7) ^ acc.wrapping_mul(0x2545_F491_4F6C_DD1D));
            }
        }
        black_box(acc);
        Ok(clock::monotonic_secs())
    }
}

/// Summary of repeated inference calls.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InferenceStats {
    pub runs: u64,
    pub total: Duration,
}

impl InferenceStats {
    pub fn record(&mut self, elapsed: Duration) {
        self.runs += 1;
        self.total += elapsed;
    }

    pub fn mean_ms(&self) -> Option<f64> {
        (self.runs > 0).then(|| self.total.as_secs_f64() * 1000.0 / self.runs as f64)
    }
}
