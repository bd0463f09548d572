//! Common error types for the ingestion pipeline
//!
//! Recoverable decode anomalies (garbled headers, empty channels, board-fail
//! events) are logged and counted where they occur and never surface here.
//! Only genuinely unrecoverable conditions become an `IngestError`.

use thiserror::Error;

/// Errors that terminate a worker or prevent one from starting
#[derive(Error, Debug)]
pub enum IngestError {
    /// I/O error (output directory creation, chunk files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LZ4 frame compression error
    #[error("LZ4 frame error: {0}")]
    Lz4(#[from] lz4_flex::frame::Error),

    /// No global channel id mapped for a (board, channel) pair
    #[error("no channel mapping for board {board} channel {channel}")]
    UnknownChannel { board: i16, channel: usize },

    /// No wire format registered for a board seen in the data stream
    #[error("no data format for board {0}")]
    UnknownBoard(i16),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Benchmark document serialization failed
    #[error("benchmark serialization error: {0}")]
    Benchmarks(#[from] serde_json::Error),
}

impl IngestError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type alias using IngestError
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_channel_message() {
        let err = IngestError::UnknownChannel {
            board: 110,
            channel: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("110"));
        assert!(msg.contains("7"));
    }

    #[test]
    fn test_config_error() {
        let err = IngestError::config("compressor 'zstd' not supported");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("zstd"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such directory");
        let err: IngestError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }
}
