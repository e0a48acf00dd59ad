//! Per-stream flow-control window.
//!
//! The window counts how many unacknowledged data frames a stream may still
//! put in flight. The outbound path is the only decrementer (one slot per
//! admitted data frame, blocking when exhausted); the receive task is the
//! only incrementer (by the count carried in an inbound ACK). The counter is
//! unsigned and clamped at capacity, so it can never go negative and a
//! misbehaving peer cannot inflate it.

use std::sync::Mutex;

use tokio::sync::Notify;

/// Flow-control window: a non-negative slot counter with blocking acquire.
#[derive(Debug)]
pub(crate) struct Window {
    capacity: usize,
    available: Mutex<usize>,
    notify: Notify,
}

impl Window {
    /// Create a window with `capacity` slots, all initially available.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: Mutex::new(capacity),
            notify: Notify::new(),
        }
    }

    /// Take one slot, waiting until one is available.
    pub(crate) async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            // Register interest before re-checking to avoid a lost wakeup
            // between the failed attempt and the await.
            let notified = self.notify.notified();
            if self.try_acquire() {
                return;
            }
            notified.await;
        }
    }

    /// Take one slot if immediately available.
    pub(crate) fn try_acquire(&self) -> bool {
        let mut available = self.available.lock().expect("window lock poisoned");
        if *available > 0 {
            *available -= 1;
            true
        } else {
            false
        }
    }

    /// Return `n` slots, as carried by an inbound ACK. Clamped at capacity.
    pub(crate) fn add(&self, n: u32) {
        {
            let mut available = self.available.lock().expect("window lock poisoned");
            let new = available.saturating_add(n as usize);
            if new > self.capacity {
                tracing::warn!(
                    acked = n,
                    capacity = self.capacity,
                    "ACK would exceed window capacity, clamping"
                );
                *available = self.capacity;
            } else {
                *available = new;
            }
        }
        self.notify.notify_waiters();
    }

    /// Currently available slots.
    pub(crate) fn available(&self) -> usize {
        *self.available.lock().expect("window lock poisoned")
    }

    /// Configured capacity.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_try_acquire_until_exhausted() {
        let w = Window::new(3);
        assert!(w.try_acquire());
        assert!(w.try_acquire());
        assert!(w.try_acquire());
        assert!(!w.try_acquire());
        assert_eq!(w.available(), 0);
    }

    #[test]
    fn test_add_replenishes() {
        let w = Window::new(5);
        for _ in 0..5 {
            assert!(w.try_acquire());
        }
        w.add(3);
        assert_eq!(w.available(), 3);
        w.add(2);
        assert_eq!(w.available(), 5);
    }

    #[test]
    fn test_add_clamped_at_capacity() {
        let w = Window::new(5);
        w.add(100);
        assert_eq!(w.available(), w.capacity());
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_ack() {
        let w = Arc::new(Window::new(1));
        assert!(w.try_acquire());

        let w2 = Arc::clone(&w);
        let waiter = tokio::spawn(async move {
            w2.acquire().await;
        });

        // Give the waiter a chance to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        w.add(1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire should resume after add")
            .unwrap();
        assert_eq!(w.available(), 0);
    }

    #[tokio::test]
    async fn test_window_stays_in_bounds_under_churn() {
        let w = Arc::new(Window::new(4));
        for _ in 0..100 {
            w.acquire().await;
            assert!(w.available() < 4);
            w.add(1);
            assert!(w.available() <= 4);
        }
        assert_eq!(w.available(), 4);
    }
}
