//! Benchmark persistence
//!
//! Each worker accumulates throughput counters over its lifetime and saves
//! them as a JSON document at teardown, one file per worker tag.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::error::IngestResult;

/// Cumulative per-worker counters, written once at shutdown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerBenchmarks {
    /// Worker tag the counters belong to
    pub worker_tag: String,
    /// Bytes of raw packet data parsed
    pub bytes: u64,
    /// Fragments emitted
    pub fragments: u64,
    /// Digitizer events seen
    pub events: u64,
    /// Data packets parsed
    pub data_packets: u64,
    /// Histogram of batch sizes returned by the packet source
    pub buffer_counter: BTreeMap<usize, u64>,
    /// Cumulative packet processing time in microseconds
    pub processing_micros: u64,
    /// Cumulative compression + write time in microseconds
    pub compression_micros: u64,
}

impl WorkerBenchmarks {
    /// Write the document to `{dir}/{file_tag}.json`
    pub fn save(&self, dir: &Path, file_tag: &str) -> IngestResult<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{file_tag}.json"));
        fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        info!(
            path = %path.display(),
            bytes = self.bytes,
            fragments = self.fragments,
            "Saved worker benchmarks"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut bench = WorkerBenchmarks {
            worker_tag: "0".to_string(),
            bytes: 4096,
            fragments: 12,
            events: 3,
            data_packets: 2,
            processing_micros: 150,
            compression_micros: 80,
            ..Default::default()
        };
        bench.buffer_counter.insert(1, 2);

        bench.save(dir.path(), "host_0").unwrap();

        let raw = fs::read_to_string(dir.path().join("host_0.json")).unwrap();
        let reloaded: WorkerBenchmarks = serde_json::from_str(&raw).unwrap();
        assert_eq!(reloaded.bytes, 4096);
        assert_eq!(reloaded.fragments, 12);
        assert_eq!(reloaded.buffer_counter.get(&1), Some(&2));
    }
}
