//! Session lifecycle counters.
//!
//! Metrics are an explicit collector object shared by `Arc`, not a
//! process-wide global: callers create one, hand it to the sessions they want
//! counted, and decide themselves whether to start the periodic reporter.
//! Loop counters exist to catch leaks; in steady state `recv_loops` and
//! `send_loops` equal twice-checked `open_sessions + closing_sessions`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Shared lifecycle counters for a set of sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    open_sessions: AtomicUsize,
    closing_sessions: AtomicUsize,
    closed_sessions: AtomicUsize,
    recv_loops: AtomicUsize,
    send_loops: AtomicUsize,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub open_sessions: usize,
    pub closing_sessions: usize,
    pub closed_sessions: usize,
    pub recv_loops: usize,
    pub send_loops: usize,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session_opened(&self) {
        self.inner.open_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closing(&self) {
        self.inner.open_sessions.fetch_sub(1, Ordering::Relaxed);
        self.inner.closing_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.inner.closing_sessions.fetch_sub(1, Ordering::Relaxed);
        self.inner.closed_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recv_loop_started(&self) {
        self.inner.recv_loops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recv_loop_stopped(&self) {
        self.inner.recv_loops.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn send_loop_started(&self) {
        self.inner.send_loops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn send_loop_stopped(&self) {
        self.inner.send_loops.fetch_sub(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            open_sessions: self.inner.open_sessions.load(Ordering::Relaxed),
            closing_sessions: self.inner.closing_sessions.load(Ordering::Relaxed),
            closed_sessions: self.inner.closed_sessions.load(Ordering::Relaxed),
            recv_loops: self.inner.recv_loops.load(Ordering::Relaxed),
            send_loops: self.inner.send_loops.load(Ordering::Relaxed),
        }
    }

    /// Start a background task logging a snapshot every `interval`.
    ///
    /// Runs until aborted; holds only the counters, never the sessions.
    pub fn spawn_reporter(&self, interval: Duration) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let s = metrics.snapshot();
                tracing::debug!(
                    open = s.open_sessions,
                    closing = s.closing_sessions,
                    closed = s.closed_sessions,
                    recv_loops = s.recv_loops,
                    send_loops = s.send_loops,
                    "session metrics"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counting() {
        let m = SessionMetrics::new();
        m.session_opened();
        m.session_opened();
        assert_eq!(m.snapshot().open_sessions, 2);

        m.session_closing();
        let s = m.snapshot();
        assert_eq!(s.open_sessions, 1);
        assert_eq!(s.closing_sessions, 1);

        m.session_closed();
        let s = m.snapshot();
        assert_eq!(s.closing_sessions, 0);
        assert_eq!(s.closed_sessions, 1);
    }

    #[test]
    fn test_loop_counters() {
        let m = SessionMetrics::new();
        m.recv_loop_started();
        m.send_loop_started();
        let s = m.snapshot();
        assert_eq!((s.recv_loops, s.send_loops), (1, 1));

        m.recv_loop_stopped();
        m.send_loop_stopped();
        let s = m.snapshot();
        assert_eq!((s.recv_loops, s.send_loops), (0, 0));
    }

    #[test]
    fn test_clones_share_counters() {
        let m = SessionMetrics::new();
        let clone = m.clone();
        clone.session_opened();
        assert_eq!(m.snapshot().open_sessions, 1);
    }
}
