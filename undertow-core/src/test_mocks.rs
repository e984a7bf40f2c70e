//! Mock implementations for testing stream sessions.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};

use crate::storage::{
    ExtendAttribute, MemoryPieceStore, PieceReader, PieceStorage, StorageError,
};
use crate::task::PeerTaskMetadata;

/// Acquire and release tallies of piece readers.
#[derive(Debug, Default)]
pub struct ReaderCounts {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ReaderCounts {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Reader that records its release when dropped.
struct CountedReader {
    inner: PieceReader,
    counts: Arc<ReaderCounts>,
}

impl AsyncRead for CountedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for CountedReader {
    fn drop(&mut self) {
        self.counts.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Piece storage over a [`MemoryPieceStore`] that counts reader handles and
/// can inject failures.
#[derive(Debug, Clone)]
pub struct MockPieceStorage {
    inner: Arc<MemoryPieceStore>,
    counts: Arc<ReaderCounts>,
    failing_piece: Option<u32>,
    fail_extend_attribute: bool,
}

impl MockPieceStorage {
    /// Creates a mock delegating to `inner`.
    pub fn new(inner: Arc<MemoryPieceStore>) -> Self {
        Self {
            inner,
            counts: Arc::new(ReaderCounts::default()),
            failing_piece: None,
            fail_extend_attribute: false,
        }
    }

    /// Creates a mock whose reads of `piece_num` fail with an I/O error.
    pub fn new_with_failing_piece(inner: Arc<MemoryPieceStore>, piece_num: u32) -> Self {
        Self {
            failing_piece: Some(piece_num),
            ..Self::new(inner)
        }
    }

    /// Creates a mock whose extended attribute lookup fails.
    pub fn new_with_attribute_failure(inner: Arc<MemoryPieceStore>) -> Self {
        Self {
            fail_extend_attribute: true,
            ..Self::new(inner)
        }
    }

    pub fn counts(&self) -> Arc<ReaderCounts> {
        Arc::clone(&self.counts)
    }

    fn counted(&self, inner: PieceReader) -> PieceReader {
        self.counts.acquired.fetch_add(1, Ordering::SeqCst);
        Box::new(CountedReader {
            inner,
            counts: Arc::clone(&self.counts),
        })
    }
}

#[async_trait]
impl PieceStorage for MockPieceStorage {
    async fn read_piece(
        &self,
        metadata: &PeerTaskMetadata,
        piece_num: u32,
    ) -> Result<PieceReader, StorageError> {
        if self.failing_piece == Some(piece_num) {
            return Err(StorageError::Io(io::Error::other(format!(
                "injected read failure for piece {piece_num}"
            ))));
        }
        let reader = self.inner.read_piece(metadata, piece_num).await?;
        Ok(self.counted(reader))
    }

    async fn read_all_pieces(
        &self,
        metadata: &PeerTaskMetadata,
    ) -> Result<PieceReader, StorageError> {
        let reader = self.inner.read_all_pieces(metadata).await?;
        Ok(self.counted(reader))
    }

    async fn extend_attribute(
        &self,
        metadata: &PeerTaskMetadata,
    ) -> Result<Option<ExtendAttribute>, StorageError> {
        if self.fail_extend_attribute {
            return Err(StorageError::Io(io::Error::other(
                "injected extend attribute failure",
            )));
        }
        self.inner.extend_attribute(metadata).await
    }
}
