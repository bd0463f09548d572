//! Chunk writer: compression and filesystem publication
//!
//! Completed buckets are compressed and written under a temp-then-rename
//! protocol so a chunk directory only ever contains fully written files:
//!
//! 1. write compressed bytes to `{run}/N_temp/{hostname}_{tag}`
//! 2. rename into `{run}/N/{hostname}_{tag}`
//!
//! Filesystem failures are logged and the chunk is dropped; there is no
//! retry. Gap filling keeps the run tree dense: every chunk id below the
//! highest persisted one gets its directories and an empty placeholder
//! file even if this worker produced no data for it.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use lz4_flex::frame::{BlockMode, BlockSize, FrameEncoder, FrameInfo};
use tracing::{debug, error, info};

use crate::common::error::{IngestError, IngestResult};
use crate::config::{CompressorKind, StraxConfig};
use crate::ingest::chunk::{bucket_id, chunk_name, ChunkBuffer, CHUNK_NAME_LEN};

/// Name of the end-of-stream sentinel directory
pub const END_MARKER_DIR: &str = "THE_END";

/// Compresses and persists completed chunk buckets for one worker
pub struct ChunkWriter {
    run_dir: PathBuf,
    file_tag: String,
    compressor: CompressorKind,
    /// Chunk ids below this are known to exist on disk
    missing_verified: i64,
    /// Highest primary chunk id this worker has persisted
    highest_written: i64,
}

impl ChunkWriter {
    /// Create the run directory and validate the compressor selection
    pub fn new(strax: &StraxConfig, file_tag: String) -> IngestResult<Self> {
        if strax.compressor == CompressorKind::Blosc && !cfg!(feature = "blosc") {
            return Err(IngestError::config(
                "compressor 'blosc' requires building with the 'blosc' feature",
            ));
        }

        let run_dir = strax.output_path.join(&strax.run_identifier);
        fs::create_dir_all(&run_dir)?;
        info!(run_dir = %run_dir.display(), file_tag = %file_tag, "Chunk writer initialized");

        Ok(Self {
            run_dir,
            file_tag,
            compressor: strax.compressor,
            missing_verified: 0,
            highest_written: -1,
        })
    }

    /// Compress and persist every bucket sealed by `threshold`, or all of
    /// them when `end` is set. Returns time spent compressing and writing.
    pub fn flush(&mut self, chunks: &mut ChunkBuffer, threshold: i64, end: bool) -> Duration {
        let start = Instant::now();

        for (name, data) in chunks.take_ready(threshold, end) {
            match self.write_bucket(&name, &data) {
                Ok(written) => {
                    debug!(
                        bucket = %name,
                        raw_bytes = data.len(),
                        compressed_bytes = written,
                        "Persisted chunk bucket"
                    );
                    if name.len() == CHUNK_NAME_LEN {
                        let id = bucket_id(&name);
                        self.create_missing(id);
                        self.highest_written = self.highest_written.max(id);
                    }
                }
                Err(e) => {
                    // No retry; this worker's file for the chunk stays missing
                    error!(bucket = %name, error = %e, "Failed to persist chunk bucket");
                }
            }
        }

        if end {
            if self.highest_written >= 0 {
                self.create_missing(self.highest_written + 1);
            }
            self.write_end_marker();
        }

        start.elapsed()
    }

    fn write_bucket(&self, name: &str, data: &[u8]) -> IngestResult<usize> {
        let compressed = self.compress(data)?;

        let temp_dir = self.dir_path(name, true);
        fs::create_dir_all(&temp_dir)?;
        let temp_file = temp_dir.join(&self.file_tag);
        File::create(&temp_file)?.write_all(&compressed)?;

        let final_dir = self.dir_path(name, false);
        fs::create_dir_all(&final_dir)?;
        fs::rename(&temp_file, final_dir.join(&self.file_tag))?;
        // Leftover temp dir is empty now; remove it quietly
        let _ = fs::remove_dir(&temp_dir);

        Ok(compressed.len())
    }

    fn compress(&self, data: &[u8]) -> IngestResult<Vec<u8>> {
        match self.compressor {
            CompressorKind::Lz4 => compress_lz4(data),
            CompressorKind::Blosc => compress_blosc(data),
        }
    }

    /// Backfill placeholder files for every chunk id in `[missing_verified, back_from)`
    fn create_missing(&mut self, back_from: i64) {
        for id in self.missing_verified..back_from {
            let name = chunk_name(id);
            self.ensure_placeholder(&name);
            if id != 0 {
                self.ensure_placeholder(&format!("{name}_pre"));
            }
            self.ensure_placeholder(&format!("{name}_post"));
        }
        self.missing_verified = self.missing_verified.max(back_from);
    }

    fn ensure_placeholder(&self, name: &str) {
        let dir = self.dir_path(name, false);
        let path = dir.join(&self.file_tag);
        if path.exists() {
            return;
        }
        if let Err(e) = fs::create_dir_all(&dir).and_then(|_| File::create(&path).map(|_| ())) {
            error!(path = %path.display(), error = %e, "Failed to create placeholder file");
        }
    }

    fn write_end_marker(&self) {
        let dir = self.run_dir.join(END_MARKER_DIR);
        let path = dir.join(&self.file_tag);
        if let Err(e) = fs::create_dir_all(&dir).and_then(|_| File::create(&path).map(|_| ())) {
            error!(path = %path.display(), error = %e, "Failed to write end-of-stream marker");
        } else {
            info!(path = %path.display(), "Wrote end-of-stream marker");
        }
    }

    fn dir_path(&self, name: &str, temp: bool) -> PathBuf {
        if temp {
            self.run_dir.join(format!("{name}_temp"))
        } else {
            self.run_dir.join(name)
        }
    }
}

/// LZ4 frame with 256 KB linked blocks and no content checksum
fn compress_lz4(data: &[u8]) -> IngestResult<Vec<u8>> {
    let info = FrameInfo::new()
        .block_size(BlockSize::Max256KB)
        .block_mode(BlockMode::Linked);
    let mut encoder = FrameEncoder::with_frame_info(info, Vec::new());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Blosc with lz4 backend, level 5, byte shuffle, typesize 1
#[cfg(feature = "blosc")]
fn compress_blosc(data: &[u8]) -> IngestResult<Vec<u8>> {
    let ctx = blosc::Context::new()
        .compressor(blosc::Compressor::LZ4)
        .map_err(|_| IngestError::config("blosc library lacks lz4 support"))?
        .clevel(blosc::Clevel::L5)
        .shuffle(blosc::ShuffleMode::Byte)
        .typesize(Some(1));
    Ok(ctx.compress(data).into())
}

#[cfg(not(feature = "blosc"))]
fn compress_blosc(_data: &[u8]) -> IngestResult<Vec<u8>> {
    // Rejected at construction; unreachable in a running worker
    Err(IngestError::config(
        "compressor 'blosc' requires building with the 'blosc' feature",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn test_config(dir: &std::path::Path) -> StraxConfig {
        StraxConfig {
            output_path: dir.to_path_buf(),
            run_identifier: "run_test".to_string(),
            ..Default::default()
        }
    }

    fn writer(dir: &std::path::Path) -> ChunkWriter {
        ChunkWriter::new(&test_config(dir), "host_0".to_string()).unwrap()
    }

    fn decompress_lz4(path: &std::path::Path) -> Vec<u8> {
        let file = File::open(path).unwrap();
        let mut decoder = lz4_flex::frame::FrameDecoder::new(file);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_lz4_round_trip() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|v| v.to_le_bytes()).collect();
        let compressed = compress_lz4(&data).unwrap();
        assert!(!compressed.is_empty());

        let mut decoder = lz4_flex::frame::FrameDecoder::new(&compressed[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_bucket_written_and_temp_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());

        let mut chunks = ChunkBuffer::new(5_000_000_000, 500_000_000);
        chunks.add(b"hello chunk", 1_000_000_000);
        w.flush(&mut chunks, 0, true);

        let run = tmp.path().join("run_test");
        let chunk_file = run.join("000000").join("host_0");
        assert!(chunk_file.is_file());
        assert_eq!(decompress_lz4(&chunk_file), b"hello chunk");
        assert!(!run.join("000000_temp").exists());
    }

    #[test]
    fn test_threshold_seals_with_margin() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());

        let mut chunks = ChunkBuffer::new(5_000_000_000, 500_000_000);
        chunks.add(b"a", 0); // chunk 0
        chunks.add(b"b", 11_000_000_000); // chunk 2

        // threshold 2 seals only ids < 1
        w.flush(&mut chunks, 2, false);
        let run = tmp.path().join("run_test");
        assert!(run.join("000000").join("host_0").is_file());
        assert!(!run.join("000002").exists());
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_gap_filling_after_end_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());

        // Only chunk 5 has data
        let mut chunks = ChunkBuffer::new(5_000_000_000, 500_000_000);
        chunks.add(b"late data", 5 * 5_500_000_000 + 1_000_000);
        w.flush(&mut chunks, 0, true);

        let run = tmp.path().join("run_test");
        for id in 0..=5 {
            let name = chunk_name(id);
            assert!(run.join(&name).join("host_0").is_file(), "missing {name}");
            if id > 0 {
                assert!(
                    run.join(format!("{name}_pre")).join("host_0").is_file(),
                    "missing {name}_pre"
                );
            }
            assert!(
                run.join(format!("{name}_post")).join("host_0").is_file(),
                "missing {name}_post"
            );
        }
        // Chunks 0-4 are empty placeholders, chunk 5 has compressed data
        assert_eq!(
            fs::metadata(run.join("000000").join("host_0")).unwrap().len(),
            0
        );
        assert_eq!(decompress_lz4(&run.join("000005").join("host_0")), b"late data");
        // 000000 has no _pre
        assert!(!run.join("000000_pre").exists());
    }

    #[test]
    fn test_end_marker_written() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());
        let mut chunks = ChunkBuffer::new(5_000_000_000, 500_000_000);
        w.flush(&mut chunks, 0, true);

        let marker = tmp.path().join("run_test").join(END_MARKER_DIR).join("host_0");
        assert!(marker.is_file());
        assert_eq!(fs::metadata(&marker).unwrap().len(), 0);
    }

    #[test]
    fn test_placeholders_do_not_overwrite_data() {
        let tmp = tempfile::tempdir().unwrap();
        let mut w = writer(tmp.path());

        let mut chunks = ChunkBuffer::new(5_000_000_000, 500_000_000);
        chunks.add(b"early", 1_000_000); // chunk 0
        chunks.add(b"later", 2 * 5_500_000_000 + 1); // chunk 2
        w.flush(&mut chunks, 0, true);

        // Chunk 0 kept its data despite gap filling up to chunk 2
        let run = tmp.path().join("run_test");
        assert_eq!(decompress_lz4(&run.join("000000").join("host_0")), b"early");
        assert!(run.join("000001").join("host_0").is_file());
    }

    #[test]
    fn test_blosc_rejected_without_feature() {
        if cfg!(feature = "blosc") {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let cfg = StraxConfig {
            compressor: CompressorKind::Blosc,
            output_path: tmp.path().to_path_buf(),
            ..Default::default()
        };
        assert!(ChunkWriter::new(&cfg, "host_0".to_string()).is_err());
    }
}
