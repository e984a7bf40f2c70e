//! Single-producer, single-consumer byte pipe between the stream worker and
//! the consumer.
//!
//! Writes wait until the consumer has drained earlier chunks, so a slow
//! consumer throttles the worker and nothing else. The writer is closed
//! exactly once: [`PipeWriter::close`] for a clean end of stream,
//! [`PipeWriter::close_with_error`] otherwise. Dropping an unclosed writer
//! closes the pipe with a broken-pipe error so the consumer never mistakes
//! an abandoned stream for a complete one. Once a read has failed, every
//! later read fails with the same error kind.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use super::StreamError;

/// Close reason handed from writer to reader once the channel drains.
#[derive(Debug, Default)]
struct PipeShared {
    error: Mutex<Option<io::Error>>,
}

/// Write end of the pipe, owned by exactly one stream worker.
#[derive(Debug)]
pub struct PipeWriter {
    sender: Option<mpsc::Sender<Bytes>>,
    shared: Arc<PipeShared>,
}

/// Read end of the pipe, handed to the consumer.
#[derive(Debug)]
pub struct PipeReader {
    receiver: mpsc::Receiver<Bytes>,
    shared: Arc<PipeShared>,
    pending: Bytes,
    finished: bool,
    /// Kind of the error that closed the stream, repeated on later reads
    failed: Option<io::ErrorKind>,
}

/// Creates a pipe holding at most `capacity` unread chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(PipeShared::default());

    (
        PipeWriter {
            sender: Some(sender),
            shared: Arc::clone(&shared),
        },
        PipeReader {
            receiver,
            shared,
            pending: Bytes::new(),
            finished: false,
            failed: None,
        },
    )
}

impl PipeWriter {
    /// Writes a chunk, waiting for room in the pipe.
    ///
    /// # Errors
    ///
    /// - `StreamError::ConsumerClosed` - If the read end was dropped
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let sender = self.sender.as_ref().ok_or(StreamError::ConsumerClosed)?;
        sender
            .send(chunk)
            .await
            .map_err(|_| StreamError::ConsumerClosed)
    }

    /// Closes the pipe cleanly; the consumer reads end of stream after the
    /// buffered chunks.
    pub fn close(mut self) {
        self.sender.take();
    }

    /// Closes the pipe with an error; the consumer reads the buffered chunks
    /// and then the error, exactly once.
    pub fn close_with_error(mut self, error: StreamError) {
        self.shared.error.lock().replace(error.into_io_error());
        self.sender.take();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.sender.is_none() {
            return;
        }
        // Error first: the reader checks it only after the channel closes
        self.shared.error.lock().get_or_insert_with(|| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream writer dropped before closing",
            )
        });
        self.sender.take();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.pending.has_remaining() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if self.finished {
                return Poll::Ready(match self.failed {
                    Some(kind) => Err(io::Error::new(kind, "stream already failed")),
                    None => Ok(()),
                });
            }

            match ready!(self.receiver.poll_recv(cx)) {
                Some(chunk) => self.pending = chunk,
                None => {
                    self.finished = true;
                    let error = self.shared.error.lock().take();
                    if let Some(error) = error {
                        self.failed = Some(error.kind());
                        return Poll::Ready(Err(error));
                    }
                }
            }
        }
    }
}
