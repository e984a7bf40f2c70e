//! In-memory append-only piece store.
//!
//! Pieces are filled by appending bytes and may be read at any time; a read
//! of an unfinished piece sees the prefix written so far.

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use super::{ExtendAttribute, PieceReader, PieceStorage, StorageError};
use crate::task::PeerTaskMetadata;

#[derive(Debug, Default)]
struct StoredPiece {
    range_size: u64,
    data: BytesMut,
}

#[derive(Debug, Default)]
struct StoredTask {
    pieces: Vec<Option<StoredPiece>>,
    attribute: Option<ExtendAttribute>,
}

/// Piece store keeping every task fully in memory.
#[derive(Debug, Default)]
pub struct MemoryPieceStore {
    tasks: RwLock<HashMap<PeerTaskMetadata, StoredTask>>,
}

impl MemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes to a piece, creating it on first write.
    ///
    /// Returns the number of bytes of the piece stored after the append.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceOverflow` - If the append would exceed `range_size`
    pub fn append_piece(
        &self,
        metadata: &PeerTaskMetadata,
        piece_num: u32,
        range_size: u64,
        bytes: &[u8],
    ) -> Result<u64, StorageError> {
        let mut tasks = self.tasks.write();
        let task = tasks.entry(metadata.clone()).or_default();

        let index = piece_num as usize;
        if task.pieces.len() <= index {
            task.pieces.resize_with(index + 1, || None);
        }
        let piece = task.pieces[index].get_or_insert_with(|| StoredPiece {
            range_size,
            data: BytesMut::with_capacity(range_size as usize),
        });

        let attempted = piece.data.len() as u64 + bytes.len() as u64;
        if attempted > piece.range_size {
            return Err(StorageError::PieceOverflow {
                piece_num,
                attempted,
                range_size: piece.range_size,
            });
        }

        piece.data.extend_from_slice(bytes);
        Ok(piece.data.len() as u64)
    }

    /// Records extended attributes for a task.
    pub fn set_extend_attribute(&self, metadata: &PeerTaskMetadata, attribute: ExtendAttribute) {
        self.tasks
            .write()
            .entry(metadata.clone())
            .or_default()
            .attribute = Some(attribute);
    }

    fn snapshot_piece(
        &self,
        metadata: &PeerTaskMetadata,
        piece_num: u32,
    ) -> Result<Bytes, StorageError> {
        let tasks = self.tasks.read();
        let task = tasks
            .get(metadata)
            .ok_or_else(|| StorageError::TaskNotFound {
                task_id: metadata.task_id.clone(),
            })?;

        task.pieces
            .get(piece_num as usize)
            .and_then(Option::as_ref)
            .map(|piece| Bytes::copy_from_slice(&piece.data))
            .ok_or(StorageError::PieceNotFound { piece_num })
    }
}

#[async_trait]
impl PieceStorage for MemoryPieceStore {
    async fn read_piece(
        &self,
        metadata: &PeerTaskMetadata,
        piece_num: u32,
    ) -> Result<PieceReader, StorageError> {
        let bytes = self.snapshot_piece(metadata, piece_num)?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn read_all_pieces(
        &self,
        metadata: &PeerTaskMetadata,
    ) -> Result<PieceReader, StorageError> {
        let tasks = self.tasks.read();
        let task = tasks
            .get(metadata)
            .ok_or_else(|| StorageError::TaskNotFound {
                task_id: metadata.task_id.clone(),
            })?;

        let mut object = BytesMut::new();
        for (num, piece) in task.pieces.iter().enumerate() {
            let piece = piece.as_ref().ok_or(StorageError::PieceNotFound {
                piece_num: num as u32,
            })?;
            object.extend_from_slice(&piece.data);
        }

        Ok(Box::new(Cursor::new(object.freeze())))
    }

    async fn extend_attribute(
        &self,
        metadata: &PeerTaskMetadata,
    ) -> Result<Option<ExtendAttribute>, StorageError> {
        Ok(self
            .tasks
            .read()
            .get(metadata)
            .and_then(|task| task.attribute.clone()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    fn metadata() -> PeerTaskMetadata {
        PeerTaskMetadata::new("task-1", "peer-1")
    }

    async fn read_to_vec(mut reader: PieceReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_partial_piece_is_readable() {
        let store = MemoryPieceStore::new();
        let meta = metadata();

        store.append_piece(&meta, 0, 8, b"abcd").unwrap();
        let partial = read_to_vec(store.read_piece(&meta, 0).await.unwrap()).await;
        assert_eq!(partial, b"abcd");

        store.append_piece(&meta, 0, 8, b"efgh").unwrap();
        let full = read_to_vec(store.read_piece(&meta, 0).await.unwrap()).await;
        assert_eq!(full, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_append_rejects_overflow() {
        let store = MemoryPieceStore::new();
        let meta = metadata();

        store.append_piece(&meta, 0, 4, b"abc").unwrap();
        let result = store.append_piece(&meta, 0, 4, b"de");

        assert!(matches!(
            result,
            Err(StorageError::PieceOverflow {
                piece_num: 0,
                attempted: 5,
                range_size: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_read_all_pieces_in_order() {
        let store = MemoryPieceStore::new();
        let meta = metadata();

        store.append_piece(&meta, 1, 3, b"def").unwrap();
        store.append_piece(&meta, 0, 3, b"abc").unwrap();

        let object = read_to_vec(store.read_all_pieces(&meta).await.unwrap()).await;
        assert_eq!(object, b"abcdef");
    }

    #[tokio::test]
    async fn test_missing_piece_and_task() {
        let store = MemoryPieceStore::new();
        let meta = metadata();

        assert!(matches!(
            store.read_piece(&meta, 0).await,
            Err(StorageError::TaskNotFound { .. })
        ));

        store.append_piece(&meta, 2, 3, b"xyz").unwrap();
        assert!(matches!(
            store.read_piece(&meta, 1).await,
            Err(StorageError::PieceNotFound { piece_num: 1 })
        ));
        assert!(store.read_all_pieces(&meta).await.is_err());
        assert_eq!(store.extend_attribute(&meta).await.unwrap(), None);
    }
}
