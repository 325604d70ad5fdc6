//! Running-cost accumulator shared by every execution loop of a build.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Monotonic spend tracker with a hard ceiling.
///
/// Spend is stored as `f64` bits in an `AtomicU64` and accumulated with a
/// compare-and-set loop, so concurrent workers never lose an update.
#[derive(Debug)]
pub struct BudgetTracker {
    ceiling: f64,
    spent_bits: AtomicU64,
    notified: AtomicBool,
}

impl BudgetTracker {
    pub fn new(ceiling: f64) -> Self {
        Self {
            ceiling,
            spent_bits: AtomicU64::new(0f64.to_bits()),
            notified: AtomicBool::new(false),
        }
    }

    /// Add `amount` to the running total and return the new total.
    ///
    /// Negative and non-finite amounts are ignored.
    pub fn record_spend(&self, amount: f64) -> f64 {
        if !amount.is_finite() || amount <= 0.0 {
            return self.spent();
        }

        let previous = self
            .spent_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + amount).to_bits())
            })
            .unwrap_or_else(|bits| bits);

        f64::from_bits(previous) + amount
    }

    pub fn spent(&self) -> f64 {
        f64::from_bits(self.spent_bits.load(Ordering::Acquire))
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    pub fn remaining(&self) -> f64 {
        (self.ceiling - self.spent()).max(0.0)
    }

    /// True once the total has reached the ceiling. Never reverts.
    pub fn is_exceeded(&self) -> bool {
        self.spent() >= self.ceiling
    }

    /// Claim the one-shot "budget exceeded" notification.
    ///
    /// Returns `true` for exactly one caller over the tracker's lifetime, and
    /// only after the ceiling has been reached.
    pub fn claim_exceeded_notice(&self) -> bool {
        self.is_exceeded()
            && self
                .notified
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}
