//! A monotonic clock with a synchronizable, forward-only offset.
//!
//! The apparent time is a steady-clock reading plus a signed offset, and
//! `synchronize` only ever advances that offset, never regresses it —
//! regressing it would let a new leader's lease appear to start before an
//! old leader's lease actually expired, violating lease-based read safety
//! across a leadership handoff.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub struct Timekeeper {
    epoch: Instant,
    offset_millis: AtomicI64,
}

impl Timekeeper {
    pub fn new() -> Self {
        Self { epoch: Instant::now(), offset_millis: AtomicI64::new(0) }
    }

    /// The current apparent time: steady elapsed time since construction,
    /// plus the synchronized offset.
    pub fn now(&self) -> Instant {
        let elapsed = self.epoch.elapsed().as_millis() as i64;
        let offset = self.offset_millis.load(Ordering::Acquire);
        self.epoch + Duration::from_millis((elapsed + offset).max(0) as u64)
    }

    /// Move the apparent clock forward to at least `target`, if it isn't
    /// already there. Never moves it backwards.
    pub fn synchronize(&self, target: Instant) {
        let wanted_offset = target.saturating_duration_since(self.epoch).as_millis() as i64
            - self.epoch.elapsed().as_millis() as i64;
        let mut current = self.offset_millis.load(Ordering::Acquire);
        while wanted_offset > current {
            match self.offset_millis.compare_exchange_weak(
                current,
                wanted_offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for Timekeeper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronize_never_moves_time_backwards() {
        let tk = Timekeeper::new();
        let before = tk.now();
        tk.synchronize(before - Duration::from_secs(10));
        let after = tk.now();
        assert!(after >= before, "synchronize must not regress apparent time");
    }

    #[test]
    fn synchronize_can_advance_apparent_time() {
        let tk = Timekeeper::new();
        let future = tk.now() + Duration::from_secs(5);
        tk.synchronize(future);
        assert!(tk.now() >= future);
    }
}
