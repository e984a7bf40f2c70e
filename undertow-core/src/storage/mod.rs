//! Storage layer contract for piece data.
//!
//! Defines the read side of the piece store consumed by stream sessions.
//! Readers returned by [`PieceStorage`] own whatever the store needs to keep
//! the piece readable; dropping the reader releases it.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub use memory::MemoryPieceStore;

use crate::task::PeerTaskMetadata;

/// Readable bytes of one piece or of the whole stored object.
pub type PieceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Extra attributes persisted alongside a task, such as origin response
/// headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendAttribute {
    pub header: HashMap<String, String>,
}

/// Random-access read operations over a task's stored pieces.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Opens a reader over one piece.
    ///
    /// Must succeed for a piece that is still being written; the reader then
    /// yields the bytes written so far.
    ///
    /// # Errors
    ///
    /// - `StorageError::TaskNotFound` - If the task is unknown to the store
    /// - `StorageError::PieceNotFound` - If nothing of the piece is stored yet
    /// - `StorageError::Io` - If the backing medium failed
    async fn read_piece(
        &self,
        metadata: &PeerTaskMetadata,
        piece_num: u32,
    ) -> Result<PieceReader, StorageError>;

    /// Opens a reader over the complete stored object, in piece order.
    ///
    /// # Errors
    ///
    /// - `StorageError::TaskNotFound` - If the task is unknown to the store
    /// - `StorageError::Io` - If the backing medium failed
    async fn read_all_pieces(
        &self,
        metadata: &PeerTaskMetadata,
    ) -> Result<PieceReader, StorageError>;

    /// Returns the extended attributes recorded for the task, if any.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the attributes could not be read
    async fn extend_attribute(
        &self,
        metadata: &PeerTaskMetadata,
    ) -> Result<Option<ExtendAttribute>, StorageError>;
}

/// Errors that occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Task has no storage registered
    #[error("Task {task_id} not found in storage")]
    TaskNotFound { task_id: String },

    /// Requested piece has no bytes stored yet
    #[error("Piece {piece_num} not found")]
    PieceNotFound { piece_num: u32 },

    /// Write would exceed the declared range of a piece
    #[error("Piece {piece_num} overflow: {attempted} bytes exceeds range size {range_size}")]
    PieceOverflow {
        piece_num: u32,
        attempted: u64,
        range_size: u64,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
