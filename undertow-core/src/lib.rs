//! Undertow Core - Ordered streaming over out-of-order piece downloads
//!
//! A resource is split into pieces that complete concurrently and in any
//! order. This crate turns the resulting stream of "piece N is readable"
//! events into a single ordered byte stream for one consumer, delivering
//! bytes as early as the piece order allows.

pub mod config;
pub mod storage;
pub mod streaming;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{StreamConfig, UndertowConfig};
pub use storage::{MemoryPieceStore, PieceStorage, StorageError};
pub use streaming::{StreamError, StreamResponse, StreamTask};
pub use task::{CancelHandle, CancelSignal, PeerTaskMetadata, PieceEvent, TaskConductor};

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Streaming(e) => match e {
                StreamError::Cancelled => "Stream was cancelled".to_string(),
                StreamError::TaskFailed(failure) => {
                    format!("Download failed: {}", failure.reason)
                }
                StreamError::ConsumerClosed => "Client disconnected".to_string(),
                _ => "Streaming error occurred".to_string(),
            },
            UndertowError::Storage(_) => "Storage error occurred".to_string(),
            UndertowError::Configuration(e) => format!("Invalid configuration: {e}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if the error was caused by the caller rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration(_)
                | UndertowError::Streaming(StreamError::Cancelled | StreamError::ConsumerClosed)
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskFailure;

    #[test]
    fn test_user_message_carries_failure_reason() {
        let error = UndertowError::from(StreamError::TaskFailed(TaskFailure {
            code: 7,
            reason: "origin unreachable".to_string(),
        }));

        assert_eq!(error.user_message(), "Download failed: origin unreachable");
        assert!(!error.is_user_error());
        assert!(UndertowError::from(StreamError::Cancelled).is_user_error());
    }
}
