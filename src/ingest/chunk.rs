//! Chunk routing
//!
//! Every fragment belongs to the chunk covering its timestamp. Fragments in
//! the trailing overlap band of a chunk are duplicated into the next chunk's
//! `_pre` bucket and this chunk's `_post` bucket, so the downstream event
//! builder can stitch pulses that straddle a boundary.

use std::collections::BTreeMap;

/// Width of the zero-padded numeric part of bucket names
pub const CHUNK_NAME_LEN: usize = 6;

/// Zero-padded 6-digit chunk name
pub fn chunk_name(id: i64) -> String {
    format!("{:0width$}", id, width = CHUNK_NAME_LEN)
}

/// Numeric chunk id of a bucket name (`"000007_pre"` -> 7)
pub fn bucket_id(name: &str) -> i64 {
    name[..CHUNK_NAME_LEN].parse().unwrap_or(0)
}

/// In-memory buckets of serialized fragments awaiting compression
///
/// Keys are bucket names: `"NNNNNN"`, `"NNNNNN_pre"`, `"NNNNNN_post"`.
#[derive(Debug)]
pub struct ChunkBuffer {
    full_chunk_ns: i64,
    overlap_ns: i64,
    buckets: BTreeMap<String, Vec<u8>>,
    buffered_bytes: usize,
}

impl ChunkBuffer {
    pub fn new(chunk_length_ns: i64, overlap_ns: i64) -> Self {
        Self {
            full_chunk_ns: chunk_length_ns + overlap_ns,
            overlap_ns,
            buckets: BTreeMap::new(),
            buffered_bytes: 0,
        }
    }

    /// Route one serialized fragment; returns its primary chunk id
    pub fn add(&mut self, fragment: &[u8], timestamp_ns: i64) -> i64 {
        let chunk_id = timestamp_ns / self.full_chunk_ns;
        let in_pre_band = (chunk_id + 1) * self.full_chunk_ns - timestamp_ns < self.overlap_ns;

        self.buffered_bytes += fragment.len();
        let name = chunk_name(chunk_id);
        self.append(name.clone(), fragment);

        if in_pre_band {
            self.append(format!("{}_pre", chunk_name(chunk_id + 1)), fragment);
            self.append(format!("{}_post", name), fragment);
        }
        chunk_id
    }

    fn append(&mut self, key: String, fragment: &[u8]) {
        self.buckets
            .entry(key)
            .or_default()
            .extend_from_slice(fragment);
    }

    /// Remove and return buckets whose chunk id is below `threshold - 1`,
    /// or every bucket when `end` is set
    pub fn take_ready(&mut self, threshold: i64, end: bool) -> Vec<(String, Vec<u8>)> {
        let names: Vec<String> = self
            .buckets
            .keys()
            .filter(|name| end || bucket_id(name) < threshold - 1)
            .cloned()
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.buckets.remove_entry(&name))
            .collect()
    }

    /// Bytes of fragment data currently routed (primary appends only)
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    #[cfg(test)]
    pub fn bucket(&self, name: &str) -> Option<&[u8]> {
        self.buckets.get(name).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK_NS: i64 = 5_000_000_000;
    const OVERLAP_NS: i64 = 500_000_000;

    fn buffer() -> ChunkBuffer {
        ChunkBuffer::new(CHUNK_NS, OVERLAP_NS)
    }

    #[test]
    fn test_chunk_name_padding() {
        assert_eq!(chunk_name(0), "000000");
        assert_eq!(chunk_name(42), "000042");
        assert_eq!(chunk_name(123_456), "123456");
    }

    #[test]
    fn test_bucket_id_parsing() {
        assert_eq!(bucket_id("000007"), 7);
        assert_eq!(bucket_id("000007_pre"), 7);
        assert_eq!(bucket_id("000123_post"), 123);
    }

    #[test]
    fn test_mid_chunk_fragment_goes_to_primary_only() {
        let mut buf = buffer();
        // 4.0 s: well inside chunk 0
        let id = buf.add(b"frag", 4_000_000_000);
        assert_eq!(id, 0);
        assert_eq!(buf.bucket("000000"), Some(&b"frag"[..]));
        assert!(buf.bucket("000001_pre").is_none());
        assert!(buf.bucket("000000_post").is_none());
    }

    #[test]
    fn test_overlap_band_duplicates_to_pre_and_post() {
        let mut buf = buffer();
        // 5.1 s: full chunk is 5.5 s, so 0.4 s from the boundary -> in band
        let id = buf.add(b"frag", 5_100_000_000);
        assert_eq!(id, 0);
        assert_eq!(buf.bucket("000000"), Some(&b"frag"[..]));
        assert_eq!(buf.bucket("000001_pre"), Some(&b"frag"[..]));
        assert_eq!(buf.bucket("000000_post"), Some(&b"frag"[..]));
    }

    #[test]
    fn test_band_boundary_is_exclusive() {
        let mut buf = buffer();
        // Exactly overlap_ns before the boundary: 5.5 - 0.5 = 5.0 s
        buf.add(b"frag", 5_000_000_000);
        assert!(buf.bucket("000001_pre").is_none());
        // One ns later is inside the band
        buf.add(b"frag", 5_000_000_001);
        assert!(buf.bucket("000001_pre").is_some());
    }

    #[test]
    fn test_buffered_bytes_counts_primary_appends_once() {
        let mut buf = buffer();
        buf.add(&[0u8; 244], 4_000_000_000);
        buf.add(&[0u8; 244], 5_100_000_000); // duplicated into pre/post
        assert_eq!(buf.buffered_bytes(), 2 * 244);
    }

    #[test]
    fn test_take_ready_respects_threshold_margin() {
        let mut buf = buffer();
        buf.add(b"a", 0); // chunk 0
        buf.add(b"b", 5_500_000_000); // chunk 1
        buf.add(b"c", 11_000_000_000); // chunk 2

        // threshold 2: only ids < 1 are sealed
        let ready = buf.take_ready(2, false);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, "000000");

        // end flushes the rest
        let rest = buf.take_ready(0, true);
        let names: Vec<&str> = rest.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["000001", "000002"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_ready_uses_leading_digits_for_pre_post() {
        let mut buf = buffer();
        buf.add(b"x", 5_400_000_000); // chunk 0, in band -> 000000, 000001_pre, 000000_post

        let ready = buf.take_ready(2, false);
        let mut names: Vec<&str> = ready.iter().map(|(n, _)| n.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["000000", "000000_post"]);

        // 000001_pre stays until its own id seals
        assert!(buf.bucket("000001_pre").is_some());
    }
}
