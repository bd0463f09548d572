//! Configuration for the ingestion pipeline
//!
//! Loaded from TOML files:
//! - `[strax]`: chunking, fragment and output settings
//! - `[[boards]]`: per-board wire format and channel mapping
//!
//! # Example
//! ```ignore
//! let config = Config::load("config.toml")?;
//! let full_chunk = config.strax.full_chunk_ns();
//! ```

pub mod board;

pub use board::{BoardEntry, BoardFormat};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub strax: StraxConfig,

    /// Boards expected in the data stream
    #[serde(default)]
    pub boards: Vec<BoardEntry>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve a board-local channel to its global channel id
    ///
    /// Returns -1 when the pair is not mapped; callers treat that as fatal.
    pub fn get_channel(&self, board: i16, channel: usize) -> i16 {
        self.boards
            .iter()
            .find(|b| b.id == board)
            .and_then(|b| b.channels.get(channel))
            .copied()
            .unwrap_or(-1)
    }

    /// Wire formats of all configured boards, keyed by board id
    pub fn board_formats(&self) -> HashMap<i16, BoardFormat> {
        self.boards
            .iter()
            .map(|b| (b.id, b.format.clone()))
            .collect()
    }
}

/// Which compression codec chunk files use; immutable for the run
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    #[default]
    Lz4,
    Blosc,
}

/// How the packet source hands over data
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BufferType {
    /// Batched reads: one call returns a list of packets
    #[default]
    Dual,
    /// Single-packet reads
    Single,
}

/// Chunking, fragment and output settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StraxConfig {
    /// Chunk length in seconds
    pub chunk_length: f64,
    /// Chunk overlap in seconds
    pub chunk_overlap: f64,
    /// Fragment payload size in bytes
    pub fragment_payload_bytes: usize,
    /// Compression codec
    pub compressor: CompressorKind,
    /// Root of the output tree; the run directory is created below it
    pub output_path: PathBuf,
    /// Name of the run directory
    pub run_identifier: String,
    /// Packet source read mode
    pub buffer_type: BufferType,
}

impl Default for StraxConfig {
    fn default() -> Self {
        Self {
            chunk_length: 5.0,
            chunk_overlap: 0.5,
            fragment_payload_bytes: 220,
            compressor: CompressorKind::Lz4,
            output_path: PathBuf::from("./"),
            run_identifier: "run".to_string(),
            buffer_type: BufferType::Dual,
        }
    }
}

impl StraxConfig {
    /// Chunk length in nanoseconds
    pub fn chunk_length_ns(&self) -> i64 {
        (self.chunk_length * 1e9) as i64
    }

    /// Chunk overlap in nanoseconds
    pub fn chunk_overlap_ns(&self) -> i64 {
        (self.chunk_overlap * 1e9) as i64
    }

    /// Full chunk span (length + overlap) in nanoseconds
    pub fn full_chunk_ns(&self) -> i64 {
        self.chunk_length_ns() + self.chunk_overlap_ns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strax_settings() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.strax.chunk_length_ns(), 5_000_000_000);
        assert_eq!(config.strax.chunk_overlap_ns(), 500_000_000);
        assert_eq!(config.strax.full_chunk_ns(), 5_500_000_000);
        assert_eq!(config.strax.fragment_payload_bytes, 220);
        assert_eq!(config.strax.compressor, CompressorKind::Lz4);
        assert_eq!(config.strax.run_identifier, "run");
        assert_eq!(config.strax.buffer_type, BufferType::Dual);
        assert!(config.boards.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[strax]
chunk_length = 2.0
chunk_overlap = 0.25
fragment_payload_bytes = 200
compressor = "blosc"
output_path = "/data/strax"
run_identifier = "run_000123"
buffer_type = "single"

[[boards]]
id = 100
channel_header_words = 2
ns_per_clk = 10
ns_per_sample = 10
channels = [0, 1, 2, 3]

[[boards]]
id = 110
channel_header_words = 3
channel_mask_msb_idx = 2
channel_time_msb_idx = 2
ns_per_clk = 2
ns_per_sample = 2
channels = [16, 17]
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.strax.chunk_length_ns(), 2_000_000_000);
        assert_eq!(config.strax.compressor, CompressorKind::Blosc);
        assert_eq!(config.strax.buffer_type, BufferType::Single);
        assert_eq!(config.strax.output_path, PathBuf::from("/data/strax"));

        assert_eq!(config.boards.len(), 2);
        let formats = config.board_formats();
        assert_eq!(formats[&100].channel_header_words, 2);
        assert_eq!(formats[&100].channel_mask_msb_idx, -1);
        assert_eq!(formats[&110].channel_time_msb_idx, 2);
        assert_eq!(formats[&110].ns_per_clk, 2);
    }

    #[test]
    fn channel_lookup() {
        let toml = r#"
[[boards]]
id = 100
channels = [40, 41, 42]
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.get_channel(100, 0), 40);
        assert_eq!(config.get_channel(100, 2), 42);
        // Unmapped channel and unmapped board both come back as -1
        assert_eq!(config.get_channel(100, 3), -1);
        assert_eq!(config.get_channel(999, 0), -1);
    }
}
