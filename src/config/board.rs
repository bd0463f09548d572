//! Per-board wire format description
//!
//! The fields mirror what the digitizer firmware puts on the wire. A value
//! of -1 for an index field means "not present in this firmware".

use serde::Deserialize;

/// Wire-level format of one digitizer board; immutable for the run
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BoardFormat {
    /// Words of per-channel header; 0 for default firmware, >0 for DPP-DAW
    pub channel_header_words: u32,
    /// Word offset of the upper channel-mask byte, or -1
    pub channel_mask_msb_idx: i32,
    /// Word offset of the timestamp MSBs (2 enables 48-bit timestamps), or -1
    pub channel_time_msb_idx: i32,
    /// Nanoseconds per clock tick
    pub ns_per_clk: i64,
    /// Nanoseconds per waveform sample
    pub ns_per_sample: i64,
}

impl Default for BoardFormat {
    fn default() -> Self {
        Self::v1724()
    }
}

impl BoardFormat {
    /// V1724 with DPP-DAW firmware: 100 MS/s, 2-word channel header
    pub fn v1724() -> Self {
        Self {
            channel_header_words: 2,
            channel_mask_msb_idx: -1,
            channel_time_msb_idx: -1,
            ns_per_clk: 10,
            ns_per_sample: 10,
        }
    }

    /// V1730 with DPP-DAW firmware: 500 MS/s, 3-word channel header with
    /// extended channel mask and 48-bit timestamps
    pub fn v1730() -> Self {
        Self {
            channel_header_words: 3,
            channel_mask_msb_idx: 2,
            channel_time_msb_idx: 2,
            ns_per_clk: 2,
            ns_per_sample: 2,
        }
    }

    /// Default firmware: no channel headers, all channels share the event
    /// timestamp and split the event payload evenly
    pub fn default_firmware(ns_per_clk: i64, ns_per_sample: i64) -> Self {
        Self {
            channel_header_words: 0,
            channel_mask_msb_idx: -1,
            channel_time_msb_idx: -1,
            ns_per_clk,
            ns_per_sample,
        }
    }

    /// True when the per-channel timestamp is embedded as 48 bits
    pub fn has_wide_timestamp(&self) -> bool {
        self.channel_time_msb_idx == 2
    }
}

/// One `[[boards]]` entry: id, wire format, channel mapping
#[derive(Debug, Clone, Deserialize)]
pub struct BoardEntry {
    /// Board id as reported by the packet source
    pub id: i16,

    #[serde(flatten)]
    pub format: BoardFormat,

    /// Global channel id for each board-local channel index
    #[serde(default)]
    pub channels: Vec<i16>,
}

impl BoardEntry {
    pub fn new(id: i16, format: BoardFormat, channels: Vec<i16>) -> Self {
        Self {
            id,
            format,
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1724_preset() {
        let fmt = BoardFormat::v1724();
        assert_eq!(fmt.channel_header_words, 2);
        assert_eq!(fmt.channel_mask_msb_idx, -1);
        assert_eq!(fmt.channel_time_msb_idx, -1);
        assert_eq!(fmt.ns_per_clk, 10);
        assert_eq!(fmt.ns_per_sample, 10);
        assert!(!fmt.has_wide_timestamp());
    }

    #[test]
    fn test_v1730_preset() {
        let fmt = BoardFormat::v1730();
        assert_eq!(fmt.channel_header_words, 3);
        assert_eq!(fmt.channel_mask_msb_idx, 2);
        assert!(fmt.has_wide_timestamp());
        assert_eq!(fmt.ns_per_sample, 2);
    }

    #[test]
    fn test_default_firmware() {
        let fmt = BoardFormat::default_firmware(10, 10);
        assert_eq!(fmt.channel_header_words, 0);
        assert!(!fmt.has_wide_timestamp());
    }
}
