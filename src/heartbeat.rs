//! Randomised election-timeout tracker.
//!
//! A small standalone type rather than a field on some larger owner: it
//! tracks its own deadline, redraws a fresh random timeout each time it's
//! reset, and can be forced to fire early for tests or an admin-triggered
//! election.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutOutcome {
    No,
    Yes,
    Artificial,
}

struct Inner {
    last_heartbeat: Instant,
    current_timeout: Duration,
    artificial_timeout: bool,
}

/// Tracks the time since the last valid heartbeat/vote-granting contact and
/// compares it against a freshly-drawn random timeout in `[low, high]`.
pub struct HeartbeatTracker {
    low: Duration,
    high: Duration,
    inner: Mutex<Inner>,
}

impl HeartbeatTracker {
    pub fn new(low: Duration, high: Duration) -> Self {
        let current_timeout = draw(low, high);
        Self {
            low,
            high,
            inner: Mutex::new(Inner {
                last_heartbeat: Instant::now(),
                current_timeout,
                artificial_timeout: false,
            }),
        }
    }

    pub async fn refresh(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_heartbeat = Instant::now();
        inner.artificial_timeout = false;
    }

    pub async fn refresh_random_timeout(&self) {
        let mut inner = self.inner.lock().await;
        inner.current_timeout = draw(self.low, self.high);
        inner.last_heartbeat = Instant::now();
        inner.artificial_timeout = false;
    }

    pub async fn trigger_artificial_timeout(&self) {
        self.inner.lock().await.artificial_timeout = true;
    }

    pub async fn timeout(&self) -> TimeoutOutcome {
        let inner = self.inner.lock().await;
        if inner.artificial_timeout {
            return TimeoutOutcome::Artificial;
        }
        if inner.last_heartbeat.elapsed() >= inner.current_timeout {
            TimeoutOutcome::Yes
        } else {
            TimeoutOutcome::No
        }
    }

    /// Time remaining until this tracker would next report a timeout, used
    /// by the follower loop to size its sleep.
    pub async fn remaining(&self) -> Duration {
        let inner = self.inner.lock().await;
        inner.current_timeout.saturating_sub(inner.last_heartbeat.elapsed())
    }
}

fn draw(low: Duration, high: Duration) -> Duration {
    if low >= high {
        return low;
    }
    let mut rng = rand::thread_rng();
    let millis = rng.gen_range(low.as_millis()..=high.as_millis());
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_tracker_does_not_time_out() {
        let tracker = HeartbeatTracker::new(Duration::from_secs(10), Duration::from_secs(20));
        assert_eq!(tracker.timeout().await, TimeoutOutcome::No);
    }

    #[tokio::test]
    async fn artificial_timeout_fires_once() {
        let tracker = HeartbeatTracker::new(Duration::from_secs(10), Duration::from_secs(20));
        tracker.trigger_artificial_timeout().await;
        assert_eq!(tracker.timeout().await, TimeoutOutcome::Artificial);
        tracker.refresh().await;
        assert_eq!(tracker.timeout().await, TimeoutOutcome::No);
    }

    #[tokio::test]
    async fn refresh_random_timeout_also_clears_an_artificial_timeout() {
        let tracker = HeartbeatTracker::new(Duration::from_secs(10), Duration::from_secs(20));
        tracker.trigger_artificial_timeout().await;
        assert_eq!(tracker.timeout().await, TimeoutOutcome::Artificial);
        tracker.refresh_random_timeout().await;
        assert_eq!(tracker.timeout().await, TimeoutOutcome::No);
    }

    #[tokio::test]
    async fn elapsed_timeout_fires() {
        let tracker = HeartbeatTracker::new(Duration::from_millis(1), Duration::from_millis(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.timeout().await, TimeoutOutcome::Yes);
    }
}
