//! Packet source interface
//!
//! The DAQ controller owns the digitizer handles and hands raw packets to
//! ingestion workers through this interface. Workers poll non-blocking and
//! sleep briefly when nothing is available.

pub mod emulator;

pub use emulator::EmulatorSource;

use std::collections::HashMap;

use crate::config::BoardFormat;

/// One raw readout from a digitizer board
///
/// The buffer is an array of 32-bit little-endian words. A packet is owned
/// exclusively by the worker that fetched it and dropped once parsed.
#[derive(Debug, Clone)]
pub struct DataPacket {
    /// Board id the packet came from
    pub bid: i16,
    /// Count of 32-bit clock rollovers the source observed before this packet
    pub clock_counter: u32,
    /// 32-bit timestamp of the packet's first event, for rollover disambiguation
    pub header_time: u32,
    /// Raw word buffer, little-endian bytes
    pub data: Vec<u8>,
    /// Sizes of the block transfers the packet was assembled from (diagnostics only)
    pub transfer_sizes: Vec<u32>,
}

impl DataPacket {
    pub fn new(bid: i16, clock_counter: u32, header_time: u32, data: Vec<u8>) -> Self {
        Self {
            bid,
            clock_counter,
            header_time,
            data,
            transfer_sizes: Vec::new(),
        }
    }

    /// Number of complete 32-bit words in the buffer
    pub fn total_words(&self) -> usize {
        self.data.len() / 4
    }
}

/// Non-blocking packet supplier shared by all workers
///
/// Implementations handle their own synchronization; workers only see the
/// polling surface.
pub trait PacketSource: Send + Sync {
    /// Fetch a single packet if one is available
    fn try_get(&self) -> Option<Box<DataPacket>>;

    /// Fetch a batch of packets; returns false when nothing was available
    fn try_get_batch(&self, batch: &mut Vec<Box<DataPacket>>) -> bool;

    /// Wire formats of the boards this source reads, called once at worker init
    fn data_format(&self) -> HashMap<i16, BoardFormat>;

    /// Notify the source that a board raised its fail bit
    fn check_error(&self, bid: i16);
}
