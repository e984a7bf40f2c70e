//! Ordered streaming of out-of-order pieces.
//!
//! A [`StreamTask`] waits for the first sign of life from its task, resolves
//! response attributes, and hands the caller a reader. Behind the reader a
//! single worker drains pieces in index order from storage into a bounded
//! [`pipe`], pre-reading large head-of-line pieces into a reserve buffer so
//! the consumer keeps receiving bytes while such a piece finishes.

pub mod http;
pub mod pipe;
pub mod reassembly;
pub mod reporter;
pub mod reserve;
pub mod session;

use std::io;

pub use pipe::{PipeReader, PipeWriter, pipe};
pub use reporter::{NoopReporter, StreamCounters, StreamOutcome, StreamReporter};
pub use session::{
    HEADER_TASK_ID, HEADER_PEER_ID, StreamBody, StreamResponse, StreamTask,
};

use crate::config::ConfigError;
use crate::storage::StorageError;
use crate::task::TaskFailure;

/// Errors that terminate a stream, either at start or mid-stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Caller cancelled the stream
    #[error("Stream cancelled")]
    Cancelled,

    /// Task reported a terminal failure
    #[error("Stream closed with peer task fail: {0}")]
    TaskFailed(TaskFailure),

    /// Reading piece data from storage failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Copying piece bytes failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Consumer dropped the read end of the stream
    #[error("Stream consumer closed")]
    ConsumerClosed,

    /// A piece is shorter than the prefix already delivered from it
    #[error("Piece {piece} truncated: expected at least {expected} bytes, found {actual}")]
    PieceTruncated {
        piece: u32,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl StreamError {
    /// Wraps the error for delivery through an `AsyncRead`.
    ///
    /// Always of kind `Other`, which readers never retry; the inner error
    /// stays reachable through [`StreamError::from_io_error`].
    pub fn into_io_error(self) -> io::Error {
        io::Error::other(self)
    }

    /// Recovers the stream error carried by an I/O error, if any.
    pub fn from_io_error(error: &io::Error) -> Option<&StreamError> {
        error.get_ref()?.downcast_ref::<StreamError>()
    }
}

/// Result type for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_round_trip_keeps_failure_detail() {
        let error = StreamError::TaskFailed(TaskFailure {
            code: 7,
            reason: "x".to_string(),
        })
        .into_io_error();

        assert_eq!(error.kind(), io::ErrorKind::Other);
        assert_eq!(
            error.to_string(),
            "Stream closed with peer task fail: 7/x"
        );
        assert!(matches!(
            StreamError::from_io_error(&error),
            Some(StreamError::TaskFailed(failure)) if failure.code == 7
        ));
    }

    #[test]
    fn test_cancellation_is_not_retryable() {
        let error = StreamError::Cancelled.into_io_error();

        assert_eq!(error.kind(), io::ErrorKind::Other);
        assert!(matches!(
            StreamError::from_io_error(&error),
            Some(StreamError::Cancelled)
        ));
    }

    #[test]
    fn test_plain_io_error_has_no_stream_error() {
        let error = io::Error::other("disk");
        assert!(StreamError::from_io_error(&error).is_none());
    }
}
