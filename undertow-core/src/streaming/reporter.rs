//! Session lifecycle reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// How a stream session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Served straight from a completed task
    Direct,
    /// All pieces streamed, clean end of stream
    Completed,
    /// Stream closed with an error
    Failed,
}

/// Receives session lifecycle notifications.
pub trait StreamReporter: Send + Sync {
    fn stream_started(&self);

    fn stream_finished(&self, outcome: StreamOutcome, bytes: u64);
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl StreamReporter for NoopReporter {
    fn stream_started(&self) {}

    fn stream_finished(&self, _outcome: StreamOutcome, _bytes: u64) {}
}

/// Atomic counters over all sessions sharing this reporter.
#[derive(Debug, Default)]
pub struct StreamCounters {
    started: AtomicU64,
    direct: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_streamed: AtomicU64,
}

/// Point-in-time copy of [`StreamCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounterSnapshot {
    pub started: u64,
    pub direct: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_streamed: u64,
}

impl StreamCounters {
    pub fn snapshot(&self) -> StreamCounterSnapshot {
        StreamCounterSnapshot {
            started: self.started.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
        }
    }
}

impl StreamReporter for StreamCounters {
    fn stream_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn stream_finished(&self, outcome: StreamOutcome, bytes: u64) {
        let counter = match outcome {
            StreamOutcome::Direct => &self.direct,
            StreamOutcome::Completed => &self.completed,
            StreamOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes_streamed.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_track_outcomes() {
        let counters = StreamCounters::default();

        counters.stream_started();
        counters.stream_started();
        counters.stream_finished(StreamOutcome::Completed, 100);
        counters.stream_finished(StreamOutcome::Failed, 20);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.direct, 0);
        assert_eq!(snapshot.bytes_streamed, 120);
    }
}
