//! A shared "please stop" flag, backed by an `AtomicBool` a background task
//! polls plus a `Notify` to wake it early instead of waiting out its own
//! sleep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to a shutdown flag. Any clone can request a stop; any
/// clone can wait for one.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

struct Inner {
    stopping: AtomicBool,
    notify: tokio::sync::Notify,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { stopping: AtomicBool::new(false), notify: tokio::sync::Notify::new() }) }
    }

    pub fn request_stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Resolves immediately if a stop has already been requested, otherwise
    /// waits for the next `request_stop`.
    pub async fn stopped(&self) {
        if self.is_stopping() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopped_resolves_after_request_stop() {
        let handle = ShutdownHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.stopped().await;
        });
        handle.request_stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[test]
    fn is_stopping_reflects_request_stop() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_stopping());
        handle.request_stop();
        assert!(handle.is_stopping());
    }
}
