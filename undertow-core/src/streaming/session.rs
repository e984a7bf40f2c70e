//! Stream session startup.
//!
//! A session races cancellation, task failure, task success and the first
//! piece event. Whichever comes first decides whether the caller gets an
//! error, a reader over the already complete object, or a reader backed by
//! a freshly spawned reassembly worker.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::header;
use tokio::io::AsyncRead;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{Instrument, debug, error, info_span, warn};

use super::pipe::{PipeWriter, pipe};
use super::reassembly::ReassemblyEngine;
use super::reporter::{NoopReporter, StreamOutcome, StreamReporter};
use super::{StreamError, StreamResult};
use crate::config::StreamConfig;
use crate::task::conductor::terminal_status;
use crate::task::{CancelSignal, PieceEvent, TaskConductor, TaskStatus};

/// Attribute key carrying the task identifier.
pub const HEADER_TASK_ID: &str = "X-Undertow-Task";
/// Attribute key carrying the peer identifier.
pub const HEADER_PEER_ID: &str = "X-Undertow-Peer";

/// Reader handed to the consumer.
pub type StreamBody = Box<dyn AsyncRead + Send + Unpin>;

/// Successful start of a stream: the body plus response attributes.
pub struct StreamResponse {
    pub body: StreamBody,
    pub attributes: HashMap<String, String>,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("attributes", &self.attributes)
            .finish_non_exhaustive()
    }
}

/// What the startup race resolved to.
enum Startup {
    Completed,
    FirstPiece(PieceEvent),
}

/// One stream request over a task.
///
/// Subscribes to the task's piece events on creation so no event published
/// after construction is missed.
pub struct StreamTask {
    conductor: Arc<TaskConductor>,
    events: broadcast::Receiver<PieceEvent>,
    status: watch::Receiver<TaskStatus>,
    config: StreamConfig,
    reporter: Arc<dyn StreamReporter>,
}

impl StreamTask {
    pub fn new(conductor: Arc<TaskConductor>, config: StreamConfig) -> Self {
        Self::with_reporter(conductor, config, Arc::new(NoopReporter))
    }

    pub fn with_reporter(
        conductor: Arc<TaskConductor>,
        config: StreamConfig,
        reporter: Arc<dyn StreamReporter>,
    ) -> Self {
        Self {
            events: conductor.subscribe(),
            status: conductor.status(),
            conductor,
            config,
            reporter,
        }
    }

    /// Starts the stream.
    ///
    /// Resolves as soon as the task has produced its first piece or has
    /// already finished; it never waits for the whole task.
    ///
    /// # Errors
    ///
    /// - `StreamError::InvalidConfig` - If the stream configuration is unusable
    /// - `StreamError::Cancelled` - If `cancel` fired before the first piece
    /// - `StreamError::TaskFailed` - If the task failed before the first piece
    /// - `StreamError::Storage` - If extended attributes or the complete
    ///   object could not be read
    pub async fn start(mut self, cancel: CancelSignal) -> StreamResult<StreamResponse> {
        self.reporter.stream_started();
        if let Err(error) = self.config.validate() {
            self.reporter.stream_finished(StreamOutcome::Failed, 0);
            return Err(error.into());
        }

        let metadata = self.conductor.metadata().clone();
        let mut attributes = HashMap::from([
            (HEADER_TASK_ID.to_string(), metadata.task_id.clone()),
            (HEADER_PEER_ID.to_string(), metadata.peer_id.clone()),
        ]);

        let startup = match self.wait_first(&cancel).await {
            Ok(startup) => startup,
            Err(error) => {
                error!(task = %metadata, "Wait first piece failed due to {}", error);
                self.reporter.stream_finished(StreamOutcome::Failed, 0);
                return Err(error);
            }
        };

        let storage = self.conductor.storage();
        let extend = match storage.extend_attribute(&metadata).await {
            Ok(extend) => extend,
            Err(error) => {
                error!(task = %metadata, "Read extend attribute error due to {}", error);
                self.reporter.stream_finished(StreamOutcome::Failed, 0);
                return Err(error.into());
            }
        };
        if let Some(extend) = extend {
            attributes.extend(extend.header);
        }

        match self.conductor.content_length() {
            Some(length) => {
                attributes.insert(header::CONTENT_LENGTH.to_string(), length.to_string());
            }
            None => {
                attributes.insert(header::TRANSFER_ENCODING.to_string(), "chunked".to_string());
            }
        }

        match startup {
            Startup::Completed => {
                debug!(task = %metadata, "Task already complete, reading stored object");
                let body = storage.read_all_pieces(&metadata).await.inspect_err(|_| {
                    self.reporter.stream_finished(StreamOutcome::Failed, 0);
                })?;
                let length = self.conductor.content_length().unwrap_or_default();
                self.reporter.stream_finished(StreamOutcome::Direct, length);
                Ok(StreamResponse { body, attributes })
            }
            Startup::FirstPiece(first) => {
                let (writer, reader) = pipe(self.config.pipe_capacity);
                self.spawn_worker(first, writer, cancel);
                Ok(StreamResponse {
                    body: Box::new(reader),
                    attributes,
                })
            }
        }
    }

    async fn wait_first(&mut self, cancel: &CancelSignal) -> StreamResult<Startup> {
        let mut events_open = true;
        loop {
            let status = &mut self.status;
            let events = &mut self.events;

            tokio::select! {
                biased;

                () = cancel.cancelled() => return Err(StreamError::Cancelled),

                terminal = terminal_status(status) => {
                    return match terminal {
                        TaskStatus::Failed(failure) => Err(StreamError::TaskFailed(failure)),
                        _ => Ok(Startup::Completed),
                    };
                }

                received = events.recv(), if events_open => match received {
                    Ok(first) => return Ok(Startup::FirstPiece(first)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} piece events before the first one", skipped);
                        if let Some(frontier) = self.conductor.frontier_event() {
                            return Ok(Startup::FirstPiece(frontier));
                        }
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
            }
        }
    }

    fn spawn_worker(self, first: PieceEvent, mut writer: PipeWriter, cancel: CancelSignal) {
        let metadata = self.conductor.metadata().clone();
        let span = info_span!(
            "stream_task",
            task_id = %metadata.task_id,
            peer_id = %metadata.peer_id
        );
        let reporter = self.reporter;
        let mut engine = ReassemblyEngine::new(
            self.conductor,
            self.events,
            self.status,
            cancel,
            self.config,
        );

        tokio::spawn(
            async move {
                let result = engine.run(first, &mut writer).await;
                let bytes = engine.bytes_written();
                match result {
                    Ok(()) => {
                        writer.close();
                        reporter.stream_finished(StreamOutcome::Completed, bytes);
                    }
                    Err(error) => {
                        error!("Stream closed after {} bytes: {}", bytes, error);
                        writer.close_with_error(error);
                        reporter.stream_finished(StreamOutcome::Failed, bytes);
                    }
                }
            }
            .instrument(span),
        );
    }
}
