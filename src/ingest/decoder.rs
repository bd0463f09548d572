//! Packet decoder for CAEN V1724/V1730 event streams
//!
//! Walks the 32-bit little-endian word buffer of a data packet, parses
//! board-level event headers and (for DPP-DAW firmware) per-channel
//! headers, reconstructs absolute 64-bit timestamps across 31-bit trigger
//! clock rollovers, and hands each channel waveform to the fragment
//! builder.
//!
//! # Data format
//!
//! Event framing:
//! - Event header: 4 words, type nibble 0xA, size / channel mask / fail
//!   bit / 32-bit trigger time
//! - Default firmware: channels split the event payload evenly and share
//!   the event timestamp
//! - DPP-DAW firmware: each channel carries its own header with size,
//!   32-bit timestamp and optionally timestamp MSBs + baseline
//!
//! Recoverable anomalies (garbled sizes, empty channels, board-fail
//! events, stray headers inside payloads) are logged and counted; only a
//! missing channel mapping or board format is fatal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::common::error::{IngestError, IngestResult};
use crate::config::{BoardFormat, Config};
use crate::ingest::chunk::ChunkBuffer;
use crate::ingest::fragment::{self, FragmentHeader};
use crate::source::{DataPacket, PacketSource};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

mod constants {
    /// Words in a board-level event header
    pub const EVENT_HEADER_WORDS: usize = 4;

    pub const HEADER_TYPE_SHIFT: u32 = 28;
    pub const HEADER_TYPE_DATA: u32 = 0xA;
    pub const EVENT_SIZE_MASK: u32 = 0x0FFF_FFFF;
    pub const BOARD_FAIL_BIT: u32 = 0x0400_0000;
    pub const CHANNEL_MASK_LSB: u32 = 0xFF;
    pub const CHANNEL_SIZE_MASK: u32 = 0x7F_FFFF;
    pub const TIME_MSB_MASK: u32 = 0xFFFF;
    pub const BASELINE_SHIFT: u32 = 16;
    pub const BASELINE_MASK: u32 = 0x3FFF;

    /// Buffer terminator word
    pub const TERMINATOR: u32 = 0xFFFF_FFFF;

    /// Channels per board; sized for the V1730
    pub const MAX_CHANNELS: usize = 16;

    /// Sentinel: channel not yet seen in this packet
    pub const NO_TIME_SEEN: u32 = 0xFFFF_FFFF;

    /// Epoch thresholds for rollover disambiguation of first sightings
    pub const LATE_EPOCH: u32 = 1_500_000_000;
    pub const EARLY_EPOCH: u32 = 500_000_000;

    /// Rollover counter shift: 30-bit trigger clock doubled to ns units
    pub const TIME_BITS: u32 = 31;
}

use constants::*;

// ---------------------------------------------------------------------------
// Per-packet decode summary
// ---------------------------------------------------------------------------

/// What one packet produced; merged into worker counters by the caller
#[derive(Debug, Default)]
pub struct PacketOutcome {
    /// Events whose header was parsed (including board-fail events)
    pub events: u64,
    /// Waveform fragments emitted (dead-time sentinels excluded)
    pub fragments: u64,
    /// Events skipped because the board-fail bit was set
    pub board_fails: u32,
    /// Smallest primary chunk id any fragment of this packet landed in
    pub smallest_latest_chunk: Option<i64>,
    /// Bytes of waveform data per global channel
    pub data_per_chan: HashMap<i16, u64>,
}

impl PacketOutcome {
    fn track_chunk(&mut self, chunk_id: i64) {
        self.smallest_latest_chunk = Some(match self.smallest_latest_chunk {
            Some(seen) => seen.min(chunk_id),
            None => chunk_id,
        });
    }
}

// ---------------------------------------------------------------------------
// Clock reconstruction
// ---------------------------------------------------------------------------

/// Per-channel extension of the 32-bit trigger clock, reset every packet
///
/// The board-level `clock_counter` counts rollovers the source observed up
/// to the packet's first event. Individual channels can sit on either side
/// of a rollover inside the same packet, so the counter is adjusted per
/// channel on first sighting using the packet's `header_time`, and bumped
/// whenever a channel's time runs backwards.
struct ChannelClocks {
    counters: [u32; MAX_CHANNELS],
    last_seen: [u32; MAX_CHANNELS],
}

impl ChannelClocks {
    fn new(clock_counter: u32) -> Self {
        Self {
            counters: [clock_counter; MAX_CHANNELS],
            last_seen: [NO_TIME_SEEN; MAX_CHANNELS],
        }
    }

    /// Apply the rollover rules for one sighting; returns the adjusted counter
    fn advance(&mut self, channel: usize, channel_time: u32, header_time: u32) -> u32 {
        let last = self.last_seen[channel];
        if last == NO_TIME_SEEN {
            // First sighting: the channel may belong to the epoch before or
            // after the rollover the header time sits on
            if channel_time > LATE_EPOCH && header_time < EARLY_EPOCH && self.counters[channel] != 0
            {
                self.counters[channel] -= 1;
            } else if channel_time < EARLY_EPOCH && header_time > LATE_EPOCH {
                self.counters[channel] += 1;
            }
        } else if channel_time < last {
            // Time ran backwards: the clock wrapped between sightings
            self.counters[channel] += 1;
        }
        self.last_seen[channel] = channel_time;
        self.counters[channel]
    }

    fn counter(&self, channel: usize) -> u32 {
        self.counters[channel]
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decodes raw packets into fragments routed through a [`ChunkBuffer`]
pub struct PacketDecoder {
    formats: HashMap<i16, BoardFormat>,
    config: Arc<Config>,
    payload_bytes: usize,
}

impl PacketDecoder {
    pub fn new(formats: HashMap<i16, BoardFormat>, config: Arc<Config>) -> Self {
        let payload_bytes = config.strax.fragment_payload_bytes;
        Self {
            formats,
            config,
            payload_bytes,
        }
    }

    /// Parse one packet, pushing fragments into `chunks`
    ///
    /// `force_quit` is consulted at every inner loop checkpoint; when set,
    /// decoding stops after the current fragment.
    pub fn parse(
        &self,
        dp: &DataPacket,
        chunks: &mut ChunkBuffer,
        source: &dyn PacketSource,
        force_quit: &AtomicBool,
    ) -> IngestResult<PacketOutcome> {
        let fmt = self
            .formats
            .get(&dp.bid)
            .ok_or(IngestError::UnknownBoard(dp.bid))?;

        let mut outcome = PacketOutcome::default();
        let mut clocks = ChannelClocks::new(dp.clock_counter);
        let data = &dp.data;
        let total_words = dp.total_words();
        let mut idx: usize = 0;

        'words: while idx < total_words && read_u32(data, idx) != TERMINATOR {
            if read_u32(data, idx) >> HEADER_TYPE_SHIFT != HEADER_TYPE_DATA {
                // Tolerate padding between events
                idx += 1;
                continue;
            }
            if idx + EVENT_HEADER_WORDS > total_words {
                debug!(bid = dp.bid, idx, "Truncated event header at end of buffer");
                break;
            }

            let claimed = (read_u32(data, idx) & EVENT_SIZE_MASK) as usize;
            let words_in_event = claimed.min(total_words - idx);
            if words_in_event < claimed {
                debug!(
                    bid = dp.bid,
                    idx,
                    claimed,
                    available = total_words - idx,
                    transfers = dp.transfer_sizes.len(),
                    "Garbled event header"
                );
            }

            let word1 = read_u32(data, idx + 1);
            let mut channel_mask = word1 & CHANNEL_MASK_LSB;
            if fmt.channel_mask_msb_idx != -1 {
                channel_mask =
                    (((read_u32(data, idx + 2) >> 24) & 0xFF) << 8) | (word1 & CHANNEL_MASK_LSB);
            }
            let board_fail = word1 & BOARD_FAIL_BIT != 0;
            let event_time = read_u32(data, idx + 3);
            outcome.events += 1;

            if board_fail {
                outcome.board_fails += 1;
                source.check_error(dp.bid);
                idx += EVENT_HEADER_WORDS;
                continue;
            }

            let channels_in_event = channel_mask.count_ones() as usize;
            let event_start = idx;
            idx += EVENT_HEADER_WORDS;

            for channel in 0..MAX_CHANNELS {
                if channel_mask >> channel & 1 == 0 {
                    continue;
                }

                // Defaults for 'default' firmware: all channels the same size,
                // sharing the event timestamp
                let mut channel_words =
                    words_in_event.saturating_sub(EVENT_HEADER_WORDS) / channels_in_event;
                let mut channel_time = event_time;
                let mut time_msb: u32 = 0;
                let mut baseline: u16 = 0;

                // A channel header indicates DPP-DAW firmware, so override
                let header_words = fmt.channel_header_words as usize;
                if header_words > 0 {
                    if idx + header_words > total_words {
                        debug!(bid = dp.bid, channel, idx, "Truncated channel header");
                        break;
                    }
                    let claimed_ch = (read_u32(data, idx) & CHANNEL_SIZE_MASK) as usize;
                    channel_words =
                        claimed_ch.min(words_in_event.saturating_sub(idx - event_start));
                    if channel_words < claimed_ch {
                        debug!(
                            bid = dp.bid,
                            channel,
                            idx,
                            claimed = claimed_ch,
                            words_in_event,
                            "Garbled channel header"
                        );
                        idx += header_words;
                        break;
                    }
                    if channel_words <= header_words {
                        debug!(
                            bid = dp.bid,
                            channel, channel_words, header_words, "Empty channel"
                        );
                        idx += header_words - channel_words;
                        continue;
                    }
                    channel_words -= header_words;
                    channel_time = read_u32(data, idx + 1);
                    if fmt.has_wide_timestamp() {
                        let word2 = read_u32(data, idx + 2);
                        time_msb = word2 & TIME_MSB_MASK;
                        baseline = ((word2 >> BASELINE_SHIFT) & BASELINE_MASK) as u16;
                    }
                    idx += header_words;
                }

                // Rollover reconstruction only applies to the short (31-bit
                // effective) timestamps; wide-counter firmware is exempt
                let counter = if fmt.channel_header_words <= 2 {
                    clocks.advance(channel, channel_time, dp.header_time)
                } else {
                    clocks.counter(channel)
                };

                // Sanity-check the payload before trusting it
                let mut whoops = false;
                for w in 0..channel_words {
                    if idx + w >= total_words
                        || read_u32(data, idx + w) >> HEADER_TYPE_SHIFT == HEADER_TYPE_DATA
                    {
                        debug!(bid = dp.bid, channel, idx = idx + w, "Stray header in payload");
                        whoops = true;
                        break;
                    }
                }
                if idx.saturating_sub(event_start) >= words_in_event {
                    debug!(bid = dp.bid, idx, "Channel cursor ran past event");
                    whoops = true;
                }

                let time_ns = if fmt.has_wide_timestamp() {
                    fmt.ns_per_clk * (((time_msb as i64) << 32) | channel_time as i64)
                } else {
                    fmt.ns_per_clk * (((counter as i64) << TIME_BITS) | channel_time as i64)
                };

                if whoops {
                    // Some data got lost; mark the region and drop the event
                    let sentinel =
                        fragment::artificial_deadtime(time_ns, dp.bid, self.payload_bytes);
                    chunks.add(&sentinel, time_ns);
                    break;
                }

                let global = self.config.get_channel(dp.bid, channel);
                if global == -1 {
                    return Err(IngestError::UnknownChannel {
                        board: dp.bid,
                        channel,
                    });
                }

                let samples_in_pulse = channel_words * 2;
                *outcome.data_per_chan.entry(global).or_insert(0) += (samples_in_pulse * 2) as u64;

                let fragment_samples = self.payload_bytes / 2;
                let byte_offset = idx * 4;
                let mut index_in_pulse = 0usize;
                let mut fragment_index: i16 = 0;

                while index_in_pulse < samples_in_pulse {
                    let samples_this = fragment_samples.min(samples_in_pulse - index_in_pulse);
                    let time_this = time_ns
                        + fragment_samples as i64 * fmt.ns_per_sample * fragment_index as i64;

                    let start = byte_offset + index_in_pulse * 2;
                    let header = FragmentHeader {
                        time_ns: time_this,
                        samples_this_fragment: samples_this as i32,
                        sample_width_ns: fmt.ns_per_sample as i16,
                        channel: global,
                        samples_in_pulse: samples_in_pulse as i32,
                        fragment_index,
                        baseline: baseline as i16,
                    };
                    let frag = fragment::encode(
                        &header,
                        &data[start..start + samples_this * 2],
                        self.payload_bytes,
                    );

                    let chunk_id = chunks.add(&frag, time_this);
                    outcome.fragments += 1;
                    outcome.track_chunk(chunk_id);

                    fragment_index += 1;
                    index_in_pulse += samples_this;
                    if force_quit.load(Ordering::Relaxed) {
                        break;
                    }
                }
                idx += channel_words;
                if force_quit.load(Ordering::Relaxed) {
                    break 'words;
                }
            }
            if force_quit.load(Ordering::Relaxed) {
                break;
            }
        }

        Ok(outcome)
    }
}

/// Read the 32-bit little-endian word at a word index
#[inline]
fn read_u32(data: &[u8], word_idx: usize) -> u32 {
    let offset = word_idx * 4;
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
