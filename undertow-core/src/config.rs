//! Centralized configuration for Undertow.
//!
//! All tunable parameters of the streaming pipeline are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub stream: StreamConfig,
    pub task: TaskConfig,
}

/// Ordered streaming and speculative buffering configuration.
///
/// Controls when a head-of-line piece is pre-read before it finishes
/// downloading, how fast the pre-read bytes are trickled to the consumer,
/// and how much data may sit in the output pipe.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Pieces strictly larger than this are eligible for the reserve buffer
    pub large_piece_threshold: u64,
    /// Cadence of reserve buffer flushes
    pub reserve_flush_interval: Duration,
    /// Each flush writes `1 / reserve_flush_divisor` of the reserved piece
    pub reserve_flush_divisor: u64,
    /// Size of a single chunk copied from storage into the pipe
    pub copy_chunk_size: usize,
    /// Number of chunks the pipe holds before the writer blocks
    pub pipe_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            large_piece_threshold: 1024 * 1024, // 1 MiB
            reserve_flush_interval: Duration::from_secs(5),
            reserve_flush_divisor: 20, // 5% per tick
            copy_chunk_size: 64 * 1024, // 64 KiB
            pipe_capacity: 1,
        }
    }
}

impl StreamConfig {
    /// Checks that every tunable has a usable value.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Invalid` - If a divisor, size, capacity or interval is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reserve_flush_divisor == 0 {
            return Err(ConfigError::Invalid {
                field: "reserve_flush_divisor",
            });
        }
        if self.copy_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "copy_chunk_size",
            });
        }
        if self.pipe_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "pipe_capacity",
            });
        }
        if self.reserve_flush_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "reserve_flush_interval",
            });
        }
        Ok(())
    }
}

/// Piece event distribution configuration.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Events buffered per subscriber before a slow subscriber starts lagging
    pub event_channel_capacity: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 256,
        }
    }
}

/// Errors raised while validating configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {field}")]
    Invalid { field: &'static str },
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparsable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(threshold) = env_parse::<u64>("UNDERTOW_LARGE_PIECE_THRESHOLD") {
            config.stream.large_piece_threshold = threshold;
        }

        if let Some(millis) = env_parse::<u64>("UNDERTOW_RESERVE_FLUSH_INTERVAL_MS") {
            config.stream.reserve_flush_interval = Duration::from_millis(millis);
        }

        if let Some(divisor) = env_parse::<u64>("UNDERTOW_RESERVE_FLUSH_DIVISOR") {
            config.stream.reserve_flush_divisor = divisor;
        }

        if let Some(chunk) = env_parse::<usize>("UNDERTOW_COPY_CHUNK_SIZE") {
            config.stream.copy_chunk_size = chunk;
        }

        if let Some(capacity) = env_parse::<usize>("UNDERTOW_PIPE_CAPACITY") {
            config.stream.pipe_capacity = capacity;
        }

        if let Some(capacity) = env_parse::<usize>("UNDERTOW_EVENT_CHANNEL_CAPACITY") {
            config.task.event_channel_capacity = capacity;
        }

        config
    }

    /// Creates a configuration with a fast reserve cadence for tests.
    pub fn for_testing() -> Self {
        Self {
            stream: StreamConfig {
                reserve_flush_interval: Duration::from_millis(50),
                copy_chunk_size: 4096,
                ..Default::default()
            },
            task: TaskConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
