//! Publishing side of a task's piece events and terminal status.
//!
//! The conductor is fed by the piece-fetch layer: every persisted piece is
//! reported here, the contiguous completion frontier is advanced, and an
//! event is fanned out to every subscribed stream session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::{PeerTaskMetadata, PieceEvent, TaskFailure, TaskStatus};
use crate::config::TaskConfig;
use crate::storage::PieceStorage;

/// Completion bookkeeping for the pieces of one task.
#[derive(Debug)]
struct PieceTracker {
    range_sizes: Vec<Option<u64>>,
    finished: Vec<bool>,
    /// Number of leading finished pieces
    contiguous: u32,
}

impl PieceTracker {
    fn new(piece_count: u32) -> Self {
        Self {
            range_sizes: vec![None; piece_count as usize],
            finished: vec![false; piece_count as usize],
            contiguous: 0,
        }
    }

    fn ordered_num(&self) -> Option<u32> {
        self.contiguous.checked_sub(1)
    }

    /// Marks a piece finished. Returns false for duplicates and unknown pieces.
    fn finish(&mut self, num: u32, range_size: u64) -> bool {
        let index = num as usize;
        match self.finished.get(index) {
            Some(false) => {}
            _ => return false,
        }

        self.finished[index] = true;
        self.range_sizes[index] = Some(range_size);
        while self
            .finished
            .get(self.contiguous as usize)
            .copied()
            .unwrap_or(false)
        {
            self.contiguous += 1;
        }
        true
    }
}

/// Coordinates one task's piece events, content length and terminal status.
pub struct TaskConductor {
    metadata: PeerTaskMetadata,
    storage: Arc<dyn PieceStorage>,
    piece_count: u32,
    events: broadcast::Sender<PieceEvent>,
    status: watch::Sender<TaskStatus>,
    tracker: Mutex<PieceTracker>,
    content_length: RwLock<Option<u64>>,
    settled: AtomicU32,
}

impl TaskConductor {
    /// Creates a conductor for a task split into `piece_count` pieces.
    pub fn new(
        metadata: PeerTaskMetadata,
        piece_count: u32,
        storage: Arc<dyn PieceStorage>,
        config: &TaskConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (status, _) = watch::channel(TaskStatus::Running);

        Self {
            metadata,
            storage,
            piece_count,
            events,
            status,
            tracker: Mutex::new(PieceTracker::new(piece_count)),
            content_length: RwLock::new(None),
            settled: AtomicU32::new(0),
        }
    }

    pub fn metadata(&self) -> &PeerTaskMetadata {
        &self.metadata
    }

    pub fn storage(&self) -> Arc<dyn PieceStorage> {
        Arc::clone(&self.storage)
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Opens an independent subscription to piece events.
    ///
    /// Only events published after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<PieceEvent> {
        self.events.subscribe()
    }

    /// Returns a receiver observing the task status.
    pub fn status(&self) -> watch::Receiver<TaskStatus> {
        self.status.subscribe()
    }

    /// Total resource length, `None` while unknown.
    pub fn content_length(&self) -> Option<u64> {
        *self.content_length.read()
    }

    pub fn set_content_length(&self, length: u64) {
        *self.content_length.write() = Some(length);
    }

    /// Number of pieces fully written to storage.
    pub fn settled_pieces(&self) -> u32 {
        self.settled.load(Ordering::Acquire)
    }

    /// Publishes progress of a piece that is still being written.
    pub fn report_progress(&self, num: u32, range_size: u64) {
        let ordered_num = self.tracker.lock().ordered_num();
        self.publish(PieceEvent {
            num,
            ordered_num,
            range_size,
            finished: false,
        });
    }

    /// Marks a piece as fully written and publishes its completion.
    ///
    /// Returns false if the piece was already complete or out of range.
    pub fn complete_piece(&self, num: u32, range_size: u64) -> bool {
        let ordered_num = {
            let mut tracker = self.tracker.lock();
            if !tracker.finish(num, range_size) {
                debug!(
                    task = %self.metadata,
                    "Ignoring duplicate or unknown completion of piece {}",
                    num
                );
                return false;
            }
            self.settled.fetch_add(1, Ordering::AcqRel);
            tracker.ordered_num()
        };

        self.publish(PieceEvent {
            num,
            ordered_num,
            range_size,
            finished: true,
        });
        true
    }

    /// Synthesizes an event describing the current contiguous frontier.
    ///
    /// Used by subscribers that fell behind the event buffer.
    pub fn frontier_event(&self) -> Option<PieceEvent> {
        let tracker = self.tracker.lock();
        let ordered_num = tracker.ordered_num()?;
        let range_size = tracker.range_sizes[ordered_num as usize].unwrap_or_default();
        Some(PieceEvent {
            num: ordered_num,
            ordered_num: Some(ordered_num),
            range_size,
            finished: true,
        })
    }

    /// Marks the task successful. Ignored once the task is terminal.
    pub fn succeed(&self) {
        if self.set_terminal(TaskStatus::Succeeded) {
            info!(task = %self.metadata, "Task succeeded");
        }
    }

    /// Marks the task failed. Ignored once the task is terminal.
    pub fn fail(&self, code: u32, reason: impl Into<String>) {
        let failure = TaskFailure {
            code,
            reason: reason.into(),
        };
        if self.set_terminal(TaskStatus::Failed(failure.clone())) {
            warn!(task = %self.metadata, "Task failed: {}", failure);
        }
    }

    fn set_terminal(&self, terminal: TaskStatus) -> bool {
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = terminal;
            true
        })
    }

    fn publish(&self, event: PieceEvent) {
        // No subscribers is not an error: sessions may start later
        let _ = self.events.send(event);
    }
}

/// Waits until `receiver` observes a terminal status.
///
/// Receivers are only held alongside an `Arc<TaskConductor>`, which owns the
/// sender, so the channel stays open for as long as this is awaited.
pub(crate) async fn terminal_status(receiver: &mut watch::Receiver<TaskStatus>) -> TaskStatus {
    let terminal = receiver
        .wait_for(TaskStatus::is_terminal)
        .await
        .map(|status| status.clone());
    match terminal {
        Ok(status) => status,
        Err(_) => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPieceStore;

    fn conductor(piece_count: u32) -> TaskConductor {
        TaskConductor::new(
            PeerTaskMetadata::new("task", "peer"),
            piece_count,
            Arc::new(MemoryPieceStore::new()),
            &TaskConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_frontier_advances_only_when_contiguous() {
        let conductor = conductor(4);
        let mut events = conductor.subscribe();

        conductor.complete_piece(2, 10);
        conductor.complete_piece(0, 10);
        conductor.complete_piece(1, 10);

        let first = events.recv().await.unwrap();
        assert_eq!(first.num, 2);
        assert_eq!(first.ordered_num, None);

        let second = events.recv().await.unwrap();
        assert_eq!(second.ordered_num, Some(0));

        let third = events.recv().await.unwrap();
        assert_eq!(third.ordered_num, Some(2));
        assert!(third.finished);
        assert_eq!(conductor.settled_pieces(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_completions_ignored() {
        let conductor = conductor(2);

        assert!(conductor.complete_piece(0, 5));
        assert!(!conductor.complete_piece(0, 5));
        assert!(!conductor.complete_piece(9, 5));
        assert_eq!(conductor.settled_pieces(), 1);
    }

    #[tokio::test]
    async fn test_progress_event_is_unfinished() {
        let conductor = conductor(2);
        let mut events = conductor.subscribe();

        conductor.complete_piece(0, 5);
        conductor.report_progress(1, 5);

        let _ = events.recv().await.unwrap();
        let progress = events.recv().await.unwrap();
        assert_eq!(progress.num, 1);
        assert_eq!(progress.ordered_num, Some(0));
        assert!(!progress.finished);
    }

    #[test]
    fn test_first_terminal_status_wins() {
        let conductor = conductor(1);
        let status = conductor.status();

        conductor.fail(7, "x");
        conductor.succeed();

        assert_eq!(
            *status.borrow(),
            TaskStatus::Failed(TaskFailure {
                code: 7,
                reason: "x".to_string()
            })
        );
    }

    #[test]
    fn test_frontier_event() {
        let conductor = conductor(3);
        assert_eq!(conductor.frontier_event(), None);

        conductor.complete_piece(0, 4);
        conductor.complete_piece(1, 6);

        let frontier = conductor.frontier_event().unwrap();
        assert_eq!(frontier.num, 1);
        assert_eq!(frontier.ordered_num, Some(1));
        assert_eq!(frontier.range_size, 6);
    }
}
