//! Process-local monotonic clock.
//!
//! Every [`PowerSample`](crate::PowerSample) timestamp is seconds since a
//! single epoch captured the first time anything asks for the time, so
//! samples from different threads and sources order correctly against each
//! other and never jump with wall-clock adjustments.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed since the process-local epoch.
pub fn monotonic_secs() -> f64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = monotonic_secs();
        let b = monotonic_secs();
        assert!(b >= a);
    }
}
