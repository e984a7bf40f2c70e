//! Task-side data model and signalling.
//!
//! A task is one distributed download of a single resource. Pieces of the
//! task complete out of order; the conductor turns every completion into a
//! [`PieceEvent`] and owns the task's terminal status.

pub mod cancel;
pub mod conductor;

use std::fmt;

pub use cancel::{CancelHandle, CancelSignal};
pub use conductor::TaskConductor;

/// Identity of the peer task whose pieces are being streamed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerTaskMetadata {
    /// Content-derived task identifier, shared across peers
    pub task_id: String,
    /// Identifier of the local peer downloading the task
    pub peer_id: String,
}

impl PeerTaskMetadata {
    pub fn new(task_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            peer_id: peer_id.into(),
        }
    }
}

impl fmt::Display for PeerTaskMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.task_id, self.peer_id)
    }
}

/// Notification that a piece became readable from local storage.
///
/// Published once per piece per lifecycle edge: optionally while the piece
/// is still being filled, and once when it is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceEvent {
    /// Zero-based index of the piece this event describes
    pub num: u32,
    /// Highest index such that pieces `0..=ordered_num` are all complete,
    /// `None` while piece 0 is still missing
    pub ordered_num: Option<u32>,
    /// Byte length of the piece's range
    pub range_size: u64,
    /// Whether the whole piece (not just a prefix) is written
    pub finished: bool,
}

impl PieceEvent {
    /// Returns true if the contiguous frontier includes `index`.
    pub fn covers(&self, index: u32) -> bool {
        self.ordered_num.is_some_and(|ordered| index <= ordered)
    }
}

/// Terminal failure reported by the piece-fetch layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub code: u32,
    pub reason: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.code, self.reason)
    }
}

/// Lifecycle of a task as seen by stream sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskStatus {
    #[default]
    Running,
    Succeeded,
    Failed(TaskFailure),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_event_covers() {
        let mut event = PieceEvent {
            num: 3,
            ordered_num: None,
            range_size: 10,
            finished: true,
        };
        assert!(!event.covers(0));

        event.ordered_num = Some(2);
        assert!(event.covers(0));
        assert!(event.covers(2));
        assert!(!event.covers(3));
    }

    #[test]
    fn test_terminal_status() {
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(
            TaskStatus::Failed(TaskFailure {
                code: 7,
                reason: "x".to_string()
            })
            .is_terminal()
        );
    }
}
