//! Fragment serialization
//!
//! A fragment is the minimal unit of output: a 24-byte little-endian header
//! followed by a fixed-size payload of 16-bit samples, zero-padded.
//!
//! # Header layout
//!
//! | offset | size | field                  |
//! |--------|------|------------------------|
//! | 0      | 8    | time_this_fragment (ns)|
//! | 8      | 4    | samples_this_fragment  |
//! | 12     | 2    | sample_width_ns        |
//! | 14     | 2    | channel_global_id      |
//! | 16     | 4    | samples_in_pulse       |
//! | 20     | 2    | fragment_index         |
//! | 22     | 2    | baseline               |

/// Bytes of fragment header preceding the payload
pub const HEADER_BYTES: usize = 24;

/// Sentinel channel id marking an artificial dead-time fragment
pub const DEADTIME_CHANNEL: i16 = 790;

/// Sample width stamped on artificial dead-time fragments
pub const DEADTIME_SAMPLE_WIDTH_NS: i16 = 10;

/// Header fields of one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub time_ns: i64,
    pub samples_this_fragment: i32,
    pub sample_width_ns: i16,
    pub channel: i16,
    pub samples_in_pulse: i32,
    pub fragment_index: i16,
    pub baseline: i16,
}

impl FragmentHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time_ns.to_le_bytes());
        out.extend_from_slice(&self.samples_this_fragment.to_le_bytes());
        out.extend_from_slice(&self.sample_width_ns.to_le_bytes());
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.samples_in_pulse.to_le_bytes());
        out.extend_from_slice(&self.fragment_index.to_le_bytes());
        out.extend_from_slice(&self.baseline.to_le_bytes());
    }

    /// Parse a header back out of serialized bytes (test and tooling support)
    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            time_ns: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            samples_this_fragment: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            sample_width_ns: i16::from_le_bytes(buf[12..14].try_into().unwrap()),
            channel: i16::from_le_bytes(buf[14..16].try_into().unwrap()),
            samples_in_pulse: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
            fragment_index: i16::from_le_bytes(buf[20..22].try_into().unwrap()),
            baseline: i16::from_le_bytes(buf[22..24].try_into().unwrap()),
        }
    }
}

/// Serialize one fragment: header, sample bytes, zero padding
///
/// The result is always exactly `HEADER_BYTES + payload_bytes` long.
pub fn encode(header: &FragmentHeader, samples: &[u8], payload_bytes: usize) -> Vec<u8> {
    debug_assert!(samples.len() <= payload_bytes);
    let mut fragment = Vec::with_capacity(HEADER_BYTES + payload_bytes);
    header.write_to(&mut fragment);
    fragment.extend_from_slice(samples);
    fragment.resize(HEADER_BYTES + payload_bytes, 0);
    fragment
}

/// Build the artificial dead-time sentinel marking a decode-loss region
///
/// The payload starts with the board id as an i16, then zeros. Downstream
/// consumers recognize the fragment by its channel id.
pub fn artificial_deadtime(timestamp_ns: i64, bid: i16, payload_bytes: usize) -> Vec<u8> {
    let samples = (payload_bytes / 2) as i32;
    let header = FragmentHeader {
        time_ns: timestamp_ns,
        samples_this_fragment: samples,
        sample_width_ns: DEADTIME_SAMPLE_WIDTH_NS,
        channel: DEADTIME_CHANNEL,
        samples_in_pulse: samples,
        fragment_index: 0,
        baseline: 0,
    };
    encode(&header, &bid.to_le_bytes(), payload_bytes)
}
