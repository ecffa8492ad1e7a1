use std::sync::atomic::{AtomicU64, Ordering};

/// Server-reported update time (unix seconds) of the newest flag data seen,
/// from either a fetch response or a push event. Never moves backwards.
#[derive(Debug, Default)]
pub struct FreshnessTracker {
    bits: AtomicU64,
}

impl FreshnessTracker {
    pub fn new() -> Self {
        Self {
            bits: AtomicU64::new(0.0_f64.to_bits()),
        }
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Raise the tracked time to `updated_at` if it is newer. Returns whether
    /// the value moved.
    pub fn observe(&self, updated_at: f64) -> bool {
        if !updated_at.is_finite() {
            return false;
        }
        self.bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (updated_at > f64::from_bits(current)).then(|| updated_at.to_bits())
            })
            .is_ok()
    }
}
