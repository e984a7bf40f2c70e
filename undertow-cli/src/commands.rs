//! CLI command implementations

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, ensure};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use bytes::Bytes;
use clap::{Args, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::fs;
use tracing::{debug, info, warn};
use undertow_core::config::UndertowConfig;
use undertow_core::storage::MemoryPieceStore;
use undertow_core::streaming::{StreamCounters, StreamResponse, StreamTask};
use undertow_core::task::{CancelSignal, PeerTaskMetadata, TaskConductor};

/// Failure code reported when a simulated download is told to fail.
const SIMULATED_FAILURE_CODE: u32 = 1;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a file through a simulated out-of-order download and verify it
    Simulate {
        /// File to download
        input: PathBuf,
        /// Where the streamed bytes are written
        output: PathBuf,
        #[command(flatten)]
        download: DownloadOptions,
    },
    /// Serve a file over HTTP, simulating a fresh download per request
    Serve {
        /// File to serve
        input: PathBuf,
        /// Address to bind to
        #[arg(long, default_value = "127.0.0.1:3000")]
        bind: SocketAddr,
        #[command(flatten)]
        download: DownloadOptions,
    },
}

/// How the simulated download produces pieces.
#[derive(Args, Debug, Clone)]
pub struct DownloadOptions {
    /// Piece size in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    pub piece_size: u64,

    /// Write each piece in two halves, reporting progress in between
    #[arg(long)]
    pub partial: bool,

    /// Delay between piece writes in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Shuffle seed; random when omitted
    #[arg(long)]
    pub seed: Option<u64>,

    /// Fail the download after this many pieces complete
    #[arg(long)]
    pub fail_after: Option<u32>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            piece_size: 256 * 1024,
            partial: false,
            delay_ms: 0,
            seed: None,
            fail_after: None,
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            input,
            output,
            download,
        } => simulate(&input, &output, download).await,
        Commands::Serve {
            input,
            bind,
            download,
        } => serve(&input, bind, download).await,
    }
}

/// One simulated task: a conductor over an in-memory store.
struct SimulatedDownload {
    store: Arc<MemoryPieceStore>,
    conductor: Arc<TaskConductor>,
    pieces: Vec<Bytes>,
}

impl SimulatedDownload {
    fn new(task_id: &str, data: &Bytes, config: &UndertowConfig, piece_size: u64) -> Self {
        let pieces = split_pieces(data, piece_size);
        let store = Arc::new(MemoryPieceStore::new());
        let conductor = Arc::new(TaskConductor::new(
            PeerTaskMetadata::new(task_id, "simulated-peer"),
            pieces.len() as u32,
            store.clone(),
            &config.task,
        ));
        conductor.set_content_length(data.len() as u64);

        Self {
            store,
            conductor,
            pieces,
        }
    }

    /// Writes every piece in a shuffled order, then reports the verdict.
    async fn run(self, options: DownloadOptions) -> anyhow::Result<()> {
        let seed = options.seed.unwrap_or_else(rand::random);
        let mut order: Vec<usize> = (0..self.pieces.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        debug!(task = %self.conductor.metadata(), "Piece order seed {}", seed);

        let delay = Duration::from_millis(options.delay_ms);
        let metadata = self.conductor.metadata().clone();

        for (completed, &index) in order.iter().enumerate() {
            if options.fail_after == Some(completed as u32) {
                self.conductor
                    .fail(SIMULATED_FAILURE_CODE, "simulated download failure");
                info!(task = %metadata, "Failed download after {} pieces", completed);
                return Ok(());
            }

            let piece = &self.pieces[index];
            let num = index as u32;
            let range_size = piece.len() as u64;
            let mut written = 0;

            if options.partial && piece.len() > 1 {
                let half = piece.len() / 2;
                self.store
                    .append_piece(&metadata, num, range_size, &piece[..half])?;
                self.conductor.report_progress(num, range_size);
                written = half;
                pause(delay).await;
            }

            self.store
                .append_piece(&metadata, num, range_size, &piece[written..])?;
            self.conductor.complete_piece(num, range_size);
            pause(delay).await;
        }

        self.conductor.succeed();
        Ok(())
    }
}

async fn pause(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

/// Splits data into pieces of `piece_size`; the last piece may be shorter.
fn split_pieces(data: &Bytes, piece_size: u64) -> Vec<Bytes> {
    let piece_size = usize::try_from(piece_size.max(1)).unwrap_or(usize::MAX);
    if data.is_empty() {
        return vec![Bytes::new()];
    }
    (0..data.len())
        .step_by(piece_size)
        .map(|start| data.slice(start..(start + piece_size).min(data.len())))
        .collect()
}

/// Starts a stream over a fresh simulated download of `data`.
async fn start_simulated_stream(
    task_id: &str,
    data: &Bytes,
    config: &UndertowConfig,
    options: DownloadOptions,
    counters: Arc<StreamCounters>,
) -> anyhow::Result<StreamResponse> {
    let download = SimulatedDownload::new(task_id, data, config, options.piece_size);
    let task = StreamTask::with_reporter(
        download.conductor.clone(),
        config.stream.clone(),
        counters,
    );

    tokio::spawn(async move {
        if let Err(e) = download.run(options).await {
            warn!("Simulated download aborted: {:#}", e);
        }
    });

    Ok(task.start(CancelSignal::never()).await?)
}

/// Streams `input` through a simulated download into `output` and compares.
///
/// # Errors
/// - Reading the input or writing the output failed
/// - The stream ended with an error
/// - The streamed bytes differ from the input
pub async fn simulate(
    input: &Path,
    output: &Path,
    options: DownloadOptions,
) -> anyhow::Result<()> {
    let data = Bytes::from(
        fs::read(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?,
    );
    let config = UndertowConfig::from_env();
    let counters = Arc::new(StreamCounters::default());

    let started = Instant::now();
    let response =
        start_simulated_stream("simulate", &data, &config, options, counters.clone()).await?;
    info!("Stream started with attributes {:?}", response.attributes);

    let mut body = response.body;
    let mut file = fs::File::create(output)
        .await
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let copied = tokio::io::copy(&mut body, &mut file)
        .await
        .context("Stream ended with an error")?;
    drop(file);

    let streamed = fs::read(output).await?;
    ensure!(
        streamed == data,
        "Streamed {} bytes do not match the {} input bytes",
        streamed.len(),
        data.len()
    );

    let snapshot = counters.snapshot();
    println!(
        "Streamed {} bytes in {:.2?} ({} completed, {} direct)",
        copied,
        started.elapsed(),
        snapshot.completed,
        snapshot.direct
    );
    Ok(())
}

#[derive(Clone)]
struct ServeState {
    data: Bytes,
    config: Arc<UndertowConfig>,
    options: DownloadOptions,
    counters: Arc<StreamCounters>,
}

async fn stream_handler(
    State(state): State<ServeState>,
) -> Result<StreamResponse, (StatusCode, String)> {
    start_simulated_stream(
        "serve",
        &state.data,
        &state.config,
        state.options.clone(),
        state.counters.clone(),
    )
    .await
    .map_err(|e| (StatusCode::BAD_GATEWAY, format!("{e:#}")))
}

/// Serves `input` at `/stream`, one simulated download per request.
///
/// # Errors
/// - Reading the input or binding the listener failed
pub async fn serve(input: &Path, bind: SocketAddr, options: DownloadOptions) -> anyhow::Result<()> {
    let data = Bytes::from(
        fs::read(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?,
    );
    let state = ServeState {
        data,
        config: Arc::new(UndertowConfig::from_env()),
        options,
        counters: Arc::new(StreamCounters::default()),
    };

    let app = Router::new()
        .route("/stream", get(stream_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    println!("Undertow streaming on http://{bind}/stream");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use undertow_core::StreamError;

    use super::*;

    fn sample_data(len: usize) -> Bytes {
        (0..len).map(|i| (i % 253) as u8).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_split_pieces_keeps_short_tail() {
        let pieces = split_pieces(&sample_data(10), 4);

        let lengths: Vec<_> = pieces.iter().map(Bytes::len).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
        assert_eq!(pieces.concat(), sample_data(10).to_vec());
    }

    #[test]
    fn test_split_empty_data_is_one_empty_piece() {
        let pieces = split_pieces(&Bytes::new(), 4);
        assert_eq!(pieces, vec![Bytes::new()]);
    }

    #[tokio::test]
    async fn test_simulate_round_trips_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let output = dir.path().join("output.bin");
        fs::write(&input, sample_data(100_000)).await.unwrap();

        let options = DownloadOptions {
            piece_size: 4096,
            partial: true,
            seed: Some(42),
            ..Default::default()
        };
        simulate(&input, &output, options).await.unwrap();

        assert_eq!(fs::read(&output).await.unwrap(), sample_data(100_000));
    }

    #[tokio::test]
    async fn test_simulated_failure_reaches_reader() {
        let config = UndertowConfig::for_testing();
        let options = DownloadOptions {
            piece_size: 1000,
            delay_ms: 5,
            seed: Some(7),
            fail_after: Some(3),
            ..Default::default()
        };

        let response = start_simulated_stream(
            "failing",
            &sample_data(10_000),
            &config,
            options,
            Arc::new(StreamCounters::default()),
        )
        .await
        .unwrap();

        let mut body = response.body;
        let error = tokio::io::copy(&mut body, &mut tokio::io::sink())
            .await
            .unwrap_err();
        assert!(matches!(
            StreamError::from_io_error(&error),
            Some(StreamError::TaskFailed(failure)) if failure.code == SIMULATED_FAILURE_CODE
        ));
    }
}
