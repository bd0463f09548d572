//! Emulated packet source - fabricates digitizer packets for testing
//!
//! Builds wire-exact event buffers (default firmware or DPP-DAW) with random
//! waveform content, tracking the 31-bit trigger clock across rollovers so
//! the generated `clock_counter` / `header_time` metadata matches what a
//! real readout loop would report.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::BoardFormat;
use crate::source::{DataPacket, PacketSource};

/// 31-bit trigger clock wraps at this many ticks
const CLOCK_PERIOD: u64 = 1 << 31;

/// Emulator configuration
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Board id stamped on generated packets
    pub bid: i16,
    /// Wire format to generate
    pub format: BoardFormat,
    /// Channels that fire in every event
    pub channel_mask: u16,
    /// Waveform samples per channel per event (must be even)
    pub samples_per_channel: usize,
    /// Events per packet
    pub events_per_packet: usize,
    /// Clock ticks between consecutive events
    pub event_spacing_clk: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            bid: 100,
            format: BoardFormat::v1724(),
            channel_mask: 0b11,
            samples_per_channel: 64,
            events_per_packet: 4,
            event_spacing_clk: 250_000,
        }
    }
}

/// In-process packet source backed by a pre-filled queue
pub struct EmulatorSource {
    config: EmulatorConfig,
    formats: HashMap<i16, BoardFormat>,
    queue: Mutex<VecDeque<Box<DataPacket>>>,
    error_notices: Mutex<HashMap<i16, u32>>,
    /// Absolute trigger clock of the next generated event
    next_clk: u64,
}

impl EmulatorSource {
    pub fn new(config: EmulatorConfig) -> Self {
        let mut formats = HashMap::new();
        formats.insert(config.bid, config.format.clone());
        Self {
            config,
            formats,
            queue: Mutex::new(VecDeque::new()),
            error_notices: Mutex::new(HashMap::new()),
            next_clk: 0,
        }
    }

    /// Fabricate `n_packets` packets and append them to the queue
    pub fn fill(&mut self, n_packets: usize) {
        for _ in 0..n_packets {
            let dp = self.build_packet();
            self.queue.lock().unwrap().push_back(Box::new(dp));
        }
        debug!(
            packets = n_packets,
            bid = self.config.bid,
            "Emulator queue filled"
        );
    }

    /// Packets still waiting to be fetched
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// How many times workers reported a board-fail bit
    pub fn error_notices(&self, bid: i16) -> u32 {
        self.error_notices
            .lock()
            .unwrap()
            .get(&bid)
            .copied()
            .unwrap_or(0)
    }

    /// Push a hand-built packet, for tests that need exact wire content
    pub fn push_packet(&self, dp: DataPacket) {
        self.queue.lock().unwrap().push_back(Box::new(dp));
    }

    fn build_packet(&mut self) -> DataPacket {
        let clock_counter = (self.next_clk / CLOCK_PERIOD) as u32;
        let header_time = (self.next_clk % CLOCK_PERIOD) as u32;

        let mut data = Vec::new();
        for _ in 0..self.config.events_per_packet {
            let event_time = (self.next_clk % CLOCK_PERIOD) as u32;
            self.build_event(&mut data, event_time);
            self.next_clk += self.config.event_spacing_clk;
        }

        let mut dp = DataPacket::new(self.config.bid, clock_counter, header_time, data);
        dp.transfer_sizes = vec![dp.data.len() as u32];
        dp
    }

    fn build_event(&self, out: &mut Vec<u8>, event_time: u32) {
        let header_words = self.config.format.channel_header_words as usize;
        let sample_words = self.config.samples_per_channel / 2;
        let n_channels = self.config.channel_mask.count_ones() as usize;

        let channel_block = header_words + sample_words;
        let words_in_event = 4 + n_channels * channel_block;

        // Event header: type nibble 0xA, size, channel mask, counter, time
        push_u32(out, 0xA000_0000 | (words_in_event as u32 & 0x0FFF_FFFF));
        push_u32(out, self.config.channel_mask as u32 & 0xFF);
        let mask_msb = ((self.config.channel_mask as u32 >> 8) & 0xFF) << 24;
        push_u32(out, mask_msb);
        push_u32(out, event_time);

        let mut rng = rand::thread_rng();
        for channel in 0..16 {
            if self.config.channel_mask & (1 << channel) == 0 {
                continue;
            }
            if header_words > 0 {
                push_u32(out, channel_block as u32 & 0x7F_FFFF);
                push_u32(out, event_time);
                if header_words >= 3 {
                    // Wide-timestamp word: time MSBs low, baseline high
                    let baseline: u32 = rng.gen_range(15_900..16_100);
                    push_u32(out, (baseline & 0x3FFF) << 16);
                }
                for _ in 3..header_words {
                    push_u32(out, 0);
                }
            }
            for _ in 0..sample_words {
                let lo: u32 = rng.gen_range(15_950..16_050);
                let hi: u32 = rng.gen_range(15_950..16_050);
                push_u32(out, (hi << 16) | lo);
            }
        }
    }
}

impl PacketSource for EmulatorSource {
    fn try_get(&self) -> Option<Box<DataPacket>> {
        self.queue.lock().unwrap().pop_front()
    }

    fn try_get_batch(&self, batch: &mut Vec<Box<DataPacket>>) -> bool {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            return false;
        }
        // Hand over everything queued, like a block-transfer drain
        batch.extend(queue.drain(..));
        true
    }

    fn data_format(&self) -> HashMap<i16, BoardFormat> {
        self.formats.clone()
    }

    fn check_error(&self, bid: i16) {
        warn!(bid, "Worker reported board-fail bit");
        *self.error_notices.lock().unwrap().entry(bid).or_insert(0) += 1;
    }
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(data: &[u8], word_idx: usize) -> u32 {
        let offset = word_idx * 4;
        u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_packet_structure_v1724() {
        let mut source = EmulatorSource::new(EmulatorConfig::default());
        source.fill(1);
        let dp = source.try_get().unwrap();

        assert_eq!(dp.bid, 100);
        assert_eq!(dp.clock_counter, 0);
        assert_eq!(dp.header_time, 0);

        // First event header
        let w0 = read_u32(&dp.data, 0);
        assert_eq!(w0 >> 28, 0xA);
        let words_in_event = (w0 & 0x0FFF_FFFF) as usize;
        // 2 channels * (2 header + 32 sample words) + 4
        assert_eq!(words_in_event, 4 + 2 * (2 + 32));
        assert_eq!(read_u32(&dp.data, 1) & 0xFF, 0b11);
        assert_eq!(read_u32(&dp.data, 3), 0);

        // 4 events total
        assert_eq!(dp.total_words(), 4 * words_in_event);

        // Second event starts with another header, spaced by event_spacing_clk
        let w0_next = read_u32(&dp.data, words_in_event);
        assert_eq!(w0_next >> 28, 0xA);
        assert_eq!(read_u32(&dp.data, words_in_event + 3), 250_000);
    }

    #[test]
    fn test_clock_counter_advances_across_rollover() {
        let mut source = EmulatorSource::new(EmulatorConfig {
            event_spacing_clk: CLOCK_PERIOD / 2,
            events_per_packet: 1,
            ..Default::default()
        });
        source.fill(4);

        let counters: Vec<u32> = std::iter::from_fn(|| source.try_get())
            .map(|dp| dp.clock_counter)
            .collect();
        // Events at clk 0, 2^30*2*0.5... -> counters 0, 0, 1, 1
        assert_eq!(counters, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_batch_drains_queue() {
        let mut source = EmulatorSource::new(EmulatorConfig::default());
        source.fill(3);

        let mut batch = Vec::new();
        assert!(source.try_get_batch(&mut batch));
        assert_eq!(batch.len(), 3);
        assert_eq!(source.pending(), 0);
        assert!(!source.try_get_batch(&mut batch));
    }

    #[test]
    fn test_check_error_counted() {
        let source = EmulatorSource::new(EmulatorConfig::default());
        source.check_error(100);
        source.check_error(100);
        assert_eq!(source.error_notices(100), 2);
        assert_eq!(source.error_notices(110), 0);
    }
}
