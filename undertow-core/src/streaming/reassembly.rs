//! Ordered draining of pieces into the output pipe.
//!
//! The engine tracks `desired`, the next piece index the stream owes the
//! consumer. Bytes written to the pipe are always exactly pieces
//! `0..desired` in order, plus a delivered prefix of piece `desired` when a
//! reserve buffer has been trickled out. The prefix is reconciled before
//! `desired` advances: the rest of the piece is copied starting at the
//! delivered offset.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{Instrument, debug, debug_span, field, info, warn};

use super::pipe::PipeWriter;
use super::reserve::ReserveBuffer;
use super::{StreamError, StreamResult};
use crate::config::StreamConfig;
use crate::storage::PieceStorage;
use crate::task::conductor::terminal_status;
use crate::task::{
    CancelSignal, PeerTaskMetadata, PieceEvent, TaskConductor, TaskFailure, TaskStatus,
};

/// Why the worker woke up.
#[derive(Debug)]
enum Wake {
    Piece(PieceEvent),
    Lagged(u64),
    EventsClosed,
    Succeeded,
    Failed(TaskFailure),
    Cancelled,
    Tick,
}

/// Progress through the piece at `desired`.
#[derive(Debug, Default)]
struct HeadOfLine {
    /// Bytes of the piece already written to the pipe
    delivered: u64,
    /// Whether the single reserve read was already spent on this piece
    reserve_attempted: bool,
}

/// Drains one task's pieces, in order, into one pipe.
pub struct ReassemblyEngine {
    conductor: Arc<TaskConductor>,
    storage: Arc<dyn PieceStorage>,
    metadata: PeerTaskMetadata,
    config: StreamConfig,
    events: broadcast::Receiver<PieceEvent>,
    events_open: bool,
    status: watch::Receiver<TaskStatus>,
    cancel: CancelSignal,
    desired: u32,
    head: HeadOfLine,
    reserve: Option<ReserveBuffer>,
    bytes_written: u64,
}

impl ReassemblyEngine {
    pub fn new(
        conductor: Arc<TaskConductor>,
        events: broadcast::Receiver<PieceEvent>,
        status: watch::Receiver<TaskStatus>,
        cancel: CancelSignal,
        config: StreamConfig,
    ) -> Self {
        Self {
            storage: conductor.storage(),
            metadata: conductor.metadata().clone(),
            conductor,
            config,
            events,
            events_open: true,
            status,
            cancel,
            desired: 0,
            head: HeadOfLine::default(),
            reserve: None,
            bytes_written: 0,
        }
    }

    /// Total bytes written to the pipe so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Streams the task into `writer`, starting from the first observed event.
    ///
    /// Returns `Ok` once every piece has been written after task success.
    /// The caller closes the pipe according to the result.
    ///
    /// # Errors
    ///
    /// - `StreamError::Cancelled` - If the caller cancelled
    /// - `StreamError::TaskFailed` - If the task failed
    /// - `StreamError::Storage` / `StreamError::Io` - If reading a piece failed,
    ///   including a piece still missing after task success
    /// - `StreamError::ConsumerClosed` - If the reader was dropped
    pub async fn run(&mut self, first: PieceEvent, writer: &mut PipeWriter) -> StreamResult<()> {
        let period = self.config.reserve_flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut piece = first;
        loop {
            self.drain_ordered(&piece, writer).await?;

            if self.should_reserve(&piece) {
                self.start_reserve(&piece).await?;
                ticker.reset();
            }

            match self.next_wake(&mut ticker).await {
                Wake::Piece(event) => piece = event,
                Wake::Lagged(skipped) => {
                    warn!(
                        task = %self.metadata,
                        "Piece subscription lagged by {} events, resyncing to frontier",
                        skipped
                    );
                    if let Some(frontier) = self.conductor.frontier_event() {
                        piece = frontier;
                    }
                }
                Wake::EventsClosed => {
                    debug!(task = %self.metadata, "Piece subscription closed");
                    self.events_open = false;
                }
                Wake::Succeeded => return self.drain_remaining(writer).await,
                Wake::Failed(failure) => return Err(StreamError::TaskFailed(failure)),
                Wake::Cancelled => return Err(StreamError::Cancelled),
                Wake::Tick => self.flush_reserve_tick(writer).await?,
            }
        }
    }

    async fn next_wake(&mut self, ticker: &mut Interval) -> Wake {
        let reserve_active = self.reserve.is_some();
        let events_open = self.events_open;
        let cancel = &self.cancel;
        let status = &mut self.status;
        let events = &mut self.events;

        tokio::select! {
            biased;

            () = cancel.cancelled() => Wake::Cancelled,

            terminal = terminal_status(status) => match terminal {
                TaskStatus::Failed(failure) => Wake::Failed(failure),
                _ => Wake::Succeeded,
            },

            received = events.recv(), if events_open => match received {
                Ok(event) => Wake::Piece(event),
                Err(RecvError::Lagged(skipped)) => Wake::Lagged(skipped),
                Err(RecvError::Closed) => Wake::EventsClosed,
            },

            _ = ticker.tick(), if reserve_active => Wake::Tick,
        }
    }

    /// Writes every piece the event's contiguous frontier covers.
    async fn drain_ordered(
        &mut self,
        event: &PieceEvent,
        writer: &mut PipeWriter,
    ) -> StreamResult<()> {
        if !event.covers(self.desired) {
            return Ok(());
        }
        self.flush_reserve(writer).await?;
        while event.covers(self.desired) {
            self.write_head_piece(writer).await?;
        }
        Ok(())
    }

    /// Writes every piece left after task success.
    ///
    /// Pieces the conductor never saw settle are still read from storage; a
    /// piece that is genuinely missing fails the stream.
    async fn drain_remaining(&mut self, writer: &mut PipeWriter) -> StreamResult<()> {
        self.flush_reserve(writer).await?;

        let piece_count = self.conductor.piece_count();
        let settled = self.conductor.settled_pieces();
        if settled != piece_count {
            warn!(
                task = %self.metadata,
                "Task succeeded with {} of {} pieces settled",
                settled,
                piece_count
            );
        }

        while self.desired < piece_count {
            self.write_head_piece(writer).await?;
        }

        info!(
            task = %self.metadata,
            "All {} pieces wrote to pipe, {} bytes",
            self.desired,
            self.bytes_written
        );
        Ok(())
    }

    /// Copies the undelivered part of piece `desired` and advances.
    async fn write_head_piece(&mut self, writer: &mut PipeWriter) -> StreamResult<()> {
        debug_assert!(self.reserve.is_none(), "reserve must be reconciled first");

        let piece = self.desired;
        let span = debug_span!("write_back_piece", piece, size = field::Empty);
        let wrote = self
            .copy_piece(piece, self.head.delivered, writer)
            .instrument(span.clone())
            .await?;
        span.record("size", wrote);
        debug!(task = %self.metadata, "Wrote piece {} to pipe, size {}", piece, wrote);

        self.bytes_written += wrote;
        self.desired += 1;
        self.head = HeadOfLine::default();
        Ok(())
    }

    /// Streams one piece from storage, skipping the first `skip` bytes.
    ///
    /// The storage reader lives only for this call, so it is released on
    /// every return path.
    async fn copy_piece(
        &self,
        piece: u32,
        skip: u64,
        writer: &mut PipeWriter,
    ) -> StreamResult<u64> {
        let mut reader = self.storage.read_piece(&self.metadata, piece).await?;

        if skip > 0 {
            let skipped =
                tokio::io::copy(&mut (&mut reader).take(skip), &mut tokio::io::sink()).await?;
            if skipped < skip {
                return Err(StreamError::PieceTruncated {
                    piece,
                    expected: skip,
                    actual: skipped,
                });
            }
        }

        let chunk_size = self.config.copy_chunk_size;
        let mut buf = BytesMut::with_capacity(chunk_size);
        let mut wrote = 0u64;
        loop {
            buf.reserve(chunk_size);
            let read = reader.read_buf(&mut buf).await?;
            if read == 0 {
                break;
            }
            wrote += read as u64;
            self.emit(writer, buf.split().freeze()).await?;
        }

        Ok(wrote)
    }

    fn should_reserve(&self, event: &PieceEvent) -> bool {
        event.num == self.desired
            && !event.finished
            && event.range_size > self.config.large_piece_threshold
            && !self.head.reserve_attempted
            && self.reserve.is_none()
    }

    /// Captures what is currently stored of the head piece with one read.
    async fn start_reserve(&mut self, event: &PieceEvent) -> StreamResult<()> {
        self.head.reserve_attempted = true;

        let mut reader = self.storage.read_piece(&self.metadata, event.num).await?;
        let capacity = usize::try_from(event.range_size).unwrap_or(usize::MAX);
        let mut buf = BytesMut::with_capacity(capacity);
        reader.read_buf(&mut buf).await?;
        drop(reader);

        self.reserve = ReserveBuffer::new(
            event.num,
            buf.freeze(),
            event.range_size,
            self.config.reserve_flush_divisor,
        );
        if let Some(reserve) = &self.reserve {
            debug!(
                task = %self.metadata,
                "Reserved {} of {} bytes of piece {}",
                reserve.captured(),
                event.range_size,
                event.num
            );
        }
        Ok(())
    }

    /// Writes one tick's slice of the reserve buffer.
    async fn flush_reserve_tick(&mut self, writer: &mut PipeWriter) -> StreamResult<()> {
        let Some(reserve) = self.reserve.as_mut() else {
            return Ok(());
        };
        let piece = reserve.piece();
        let slice = reserve.next_slice();
        let drained = reserve.is_drained();

        let len = slice.len() as u64;
        self.emit(writer, slice).await?;
        self.head.delivered += len;
        self.bytes_written += len;
        if drained {
            self.reserve = None;
        }

        debug!(task = %self.metadata, "Wrote reserve piece {} to pipe, size {}", piece, len);
        Ok(())
    }

    /// Writes everything still held in the reserve buffer and discards it.
    async fn flush_reserve(&mut self, writer: &mut PipeWriter) -> StreamResult<()> {
        let Some(mut reserve) = self.reserve.take() else {
            return Ok(());
        };
        debug_assert_eq!(reserve.piece(), self.desired);

        let outstanding = reserve.take_outstanding();
        let len = outstanding.len() as u64;
        self.emit(writer, outstanding).await?;
        self.head.delivered += len;
        self.bytes_written += len;

        debug!(
            task = %self.metadata,
            "Flushed {} outstanding reserve bytes of piece {}",
            len,
            reserve.piece()
        );
        Ok(())
    }

    /// Writes a chunk, giving up as soon as the caller cancels.
    async fn emit(&self, writer: &mut PipeWriter, chunk: Bytes) -> StreamResult<()> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(StreamError::Cancelled),
            written = writer.write(chunk) => written,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::config::TaskConfig;
    use crate::storage::{MemoryPieceStore, StorageError};
    use crate::streaming::pipe::{PipeReader, pipe};
    use crate::task::CancelHandle;

    const LARGE: u64 = 2 * 1024 * 1024;

    struct Harness {
        store: Arc<MemoryPieceStore>,
        conductor: Arc<TaskConductor>,
        cancel: CancelHandle,
    }

    impl Harness {
        fn new(piece_count: u32) -> Self {
            let store = Arc::new(MemoryPieceStore::new());
            let conductor = Arc::new(TaskConductor::new(
                PeerTaskMetadata::new("task", "peer"),
                piece_count,
                store.clone(),
                &TaskConfig::default(),
            ));
            let (cancel, _) = CancelHandle::new();
            Self {
                store,
                conductor,
                cancel,
            }
        }

        fn engine(&self) -> ReassemblyEngine {
            ReassemblyEngine::new(
                self.conductor.clone(),
                self.conductor.subscribe(),
                self.conductor.status(),
                self.cancel.signal(),
                StreamConfig::default(),
            )
        }

        fn write(&self, num: u32, range_size: u64, bytes: &[u8]) {
            self.store
                .append_piece(self.conductor.metadata(), num, range_size, bytes)
                .unwrap();
        }

        fn complete(&self, num: u32, bytes: &[u8]) {
            self.write(num, bytes.len() as u64, bytes);
            self.conductor.complete_piece(num, bytes.len() as u64);
        }
    }

    async fn read_available(reader: &mut PipeReader, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        reader.read_exact(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_reserve_only_for_large_unfinished_head() {
        let harness = Harness::new(2);
        let engine = harness.engine();
        let small = PieceEvent {
            num: 0,
            ordered_num: None,
            range_size: 1000,
            finished: false,
        };
        let large = PieceEvent {
            range_size: LARGE,
            ..small
        };

        assert!(!engine.should_reserve(&small));
        assert!(engine.should_reserve(&large));
        assert!(!engine.should_reserve(&PieceEvent {
            finished: true,
            ..large
        }));
        assert!(!engine.should_reserve(&PieceEvent { num: 1, ..large }));
    }

    #[tokio::test]
    async fn test_reserve_read_happens_once_per_piece() {
        let harness = Harness::new(1);
        harness.write(0, LARGE, &[1u8; 500]);
        let mut engine = harness.engine();
        let event = PieceEvent {
            num: 0,
            ordered_num: None,
            range_size: LARGE,
            finished: false,
        };

        engine.start_reserve(&event).await.unwrap();

        assert_eq!(engine.reserve.as_ref().map(ReserveBuffer::piece), Some(0));
        assert_eq!(engine.reserve.as_ref().map(ReserveBuffer::captured), Some(500));
        assert!(!engine.should_reserve(&event));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_trickles_on_ticks_and_reconciles() {
        let harness = Harness::new(1);
        let piece: Vec<u8> = (0..LARGE).map(|i| (i % 251) as u8).collect();
        let prefix_len = LARGE as usize / 2;
        harness.write(0, LARGE, &piece[..prefix_len]);

        let (mut writer, mut reader) = pipe(64);
        let mut engine = harness.engine();
        let first = PieceEvent {
            num: 0,
            ordered_num: None,
            range_size: LARGE,
            finished: false,
        };
        let worker = tokio::spawn(async move {
            let result = engine.run(first, &mut writer).await;
            (result, engine.bytes_written(), writer)
        });

        // One tick releases 1/20 of the range
        tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(10)).await;
        let step = LARGE as usize / 20;
        let first_slice = read_available(&mut reader, step).await;
        assert_eq!(first_slice, piece[..step]);

        harness.write(0, LARGE, &piece[prefix_len..]);
        harness.conductor.complete_piece(0, LARGE);
        harness.conductor.succeed();

        let (result, written, writer) = worker.await.unwrap();
        result.unwrap();
        writer.close();
        assert_eq!(written, LARGE);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, piece[step..]);
    }

    #[tokio::test]
    async fn test_drain_ordered_advances_desired() {
        let harness = Harness::new(3);
        harness.complete(0, b"aa");
        harness.complete(1, b"bbb");

        let (mut writer, mut reader) = pipe(8);
        let mut engine = harness.engine();
        let event = PieceEvent {
            num: 1,
            ordered_num: Some(1),
            range_size: 3,
            finished: true,
        };
        engine.drain_ordered(&event, &mut writer).await.unwrap();

        assert_eq!(engine.desired, 2);
        assert_eq!(engine.bytes_written(), 5);
        assert_eq!(read_available(&mut reader, 5).await, b"aabbb");
    }

    #[tokio::test]
    async fn test_success_with_missing_piece_is_error() {
        let harness = Harness::new(3);
        harness.complete(0, b"aa");
        harness.complete(1, b"bb");

        let (mut writer, mut reader) = pipe(8);
        let mut engine = harness.engine();
        let result = engine.drain_remaining(&mut writer).await;

        assert!(matches!(
            result,
            Err(StreamError::Storage(StorageError::PieceNotFound { piece_num: 2 }))
        ));
        assert_eq!(engine.desired, 2);
        assert_eq!(read_available(&mut reader, 4).await, b"aabb");
    }

    #[tokio::test]
    async fn test_truncated_piece_after_reserve_is_error() {
        let harness = Harness::new(1);
        harness.write(0, LARGE, &[9u8; 10]);

        let (mut writer, _reader) = pipe(8);
        let mut engine = harness.engine();
        engine.head.delivered = 20;

        let result = engine.write_head_piece(&mut writer).await;
        assert!(matches!(
            result,
            Err(StreamError::PieceTruncated {
                piece: 0,
                expected: 20,
                actual: 10
            })
        ));
    }
}
