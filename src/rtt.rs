//! Round-trip time estimation from ping/echo samples.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Fixed-point scale for the stored estimate and the smoothing factor.
const SCALE: i64 = 1000;

/// Sentinel for "no sample yet".
const UNSET: i64 = i64::MIN;

/// Exponential moving average over round-trip time samples.
///
/// The estimate is stored as nanoseconds in a single atomic, so readers on
/// any task get a consistent value without locking. Only the receive task
/// feeds samples (one per echo frame).
#[derive(Debug)]
pub struct RttEstimator {
    /// Smoothing factor in thousandths; 500 weighs old and new equally.
    alpha: i64,
    nanos: AtomicI64,
}

impl RttEstimator {
    /// Create an estimator with the given smoothing factor in `(0, 1]`.
    pub fn new(alpha: f64) -> Self {
        debug_assert!(alpha > 0.0 && alpha <= 1.0);
        Self {
            alpha: (alpha * SCALE as f64) as i64,
            nanos: AtomicI64::new(UNSET),
        }
    }

    /// Feed one sample and return the updated estimate.
    ///
    /// The first sample becomes the estimate as-is.
    pub fn update(&self, sample: Duration) -> Duration {
        let sample_nanos = sample.as_nanos().min(i64::MAX as u128) as i64;
        let prev = self.nanos.load(Ordering::Relaxed);
        let next = if prev == UNSET {
            sample_nanos
        } else {
            // i128 keeps the scaled multiply from overflowing for any
            // realistic duration.
            let blended = ((SCALE - self.alpha) as i128 * prev as i128
                + self.alpha as i128 * sample_nanos as i128)
                / SCALE as i128;
            blended as i64
        };
        self.nanos.store(next, Ordering::Relaxed);
        Duration::from_nanos(next as u64)
    }

    /// Current estimate, or `None` before the first sample.
    pub fn get(&self) -> Option<Duration> {
        match self.nanos.load(Ordering::Relaxed) {
            UNSET => None,
            nanos => Some(Duration::from_nanos(nanos as u64)),
        }
    }
}

impl Default for RttEstimator {
    /// Equal weighting of history and new samples.
    fn default() -> Self {
        Self::new(0.5)
    }
}
