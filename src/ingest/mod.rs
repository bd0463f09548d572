//! Ingestion worker
//!
//! One worker per packet stream, single-threaded internally. The worker
//! polls its packet source, decodes packets into fragments, routes them
//! into in-memory chunk buckets and seals finished chunks to disk. Workers
//! share nothing but the packet source and the output tree; every file a
//! worker writes carries its own `{hostname}_{tag}` name, so parallel
//! workers never collide.
//!
//! Lifecycle:
//! - `stop()` (soft): the worker finishes draining, then flushes every
//!   remaining bucket and writes its end-of-stream marker.
//! - `force_quit()`: decoding aborts at the next fragment checkpoint,
//!   remaining packets are dropped, buffered data is still flushed.
//! - `shutdown()`: bounded wait for drain, escalating to force-quit and
//!   finally abandoning the thread; benchmark counters are persisted on
//!   the way out.

pub mod chunk;
pub mod decoder;
pub mod fragment;
pub mod writer;

pub use chunk::ChunkBuffer;
pub use decoder::{PacketDecoder, PacketOutcome};
pub use writer::ChunkWriter;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gethostname::gethostname;
use tracing::{error, info, warn};

use crate::common::benchmarks::WorkerBenchmarks;
use crate::common::error::IngestResult;
use crate::config::{BufferType, Config};
use crate::source::{DataPacket, PacketSource};

/// Idle sleep when the packet source has nothing
const IDLE_SLEEP: Duration = Duration::from_micros(10);
/// Soft-shutdown drain wait: rounds and interval
const DRAIN_ROUNDS: usize = 10;
const DRAIN_INTERVAL: Duration = Duration::from_millis(500);
/// Grace period after raising force_quit
const FORCE_QUIT_GRACE: Duration = Duration::from_secs(2);

/// Counters and signals shared between a worker thread and its handle
#[derive(Debug, Default)]
struct SharedState {
    active: AtomicBool,
    force_quit: AtomicBool,
    running: AtomicBool,
    buffer_length: AtomicUsize,

    bytes_processed: AtomicU64,
    fragments_processed: AtomicU64,
    events_processed: AtomicU64,
    packets_processed: AtomicU64,
    proc_micros: AtomicU64,
    comp_micros: AtomicU64,

    fail_counter: Mutex<HashMap<i16, u32>>,
    data_per_chan: Mutex<HashMap<i16, u64>>,
    buffer_counter: Mutex<BTreeMap<usize, u64>>,
    fatal_error: Mutex<Option<String>>,
}

/// Snapshot of a worker's cumulative counters
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub bytes_processed: u64,
    pub fragments_processed: u64,
    pub events_processed: u64,
    pub data_packets: u64,
    pub processing_micros: u64,
    pub compression_micros: u64,
}

/// The worker's thread-local half
struct Worker {
    config: Arc<Config>,
    source: Arc<dyn PacketSource>,
    decoder: PacketDecoder,
    chunks: ChunkBuffer,
    writer: ChunkWriter,
    shared: Arc<SharedState>,
    tag: String,
}

impl Worker {
    fn run(mut self) {
        self.shared.running.store(true, Ordering::SeqCst);
        info!(tag = %self.tag, "Worker started");

        match self.read_and_insert() {
            Ok(()) => info!(
                tag = %self.tag,
                bytes = self.shared.bytes_processed.load(Ordering::Relaxed),
                fragments = self.shared.fragments_processed.load(Ordering::Relaxed),
                "Worker finished"
            ),
            Err(e) => {
                error!(tag = %self.tag, error = %e, "Worker terminated on fatal error");
                *self.shared.fatal_error.lock().unwrap() = Some(e.to_string());
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
    }

    fn read_and_insert(&mut self) -> IngestResult<()> {
        match self.config.strax.buffer_type {
            BufferType::Dual => self.drain_batched()?,
            BufferType::Single => self.drain_single()?,
        }

        if self.shared.bytes_processed.load(Ordering::Relaxed) > 0 {
            let spent = self.writer.flush(&mut self.chunks, 0, true);
            self.shared
                .comp_micros
                .fetch_add(spent.as_micros() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn drain_batched(&mut self) -> IngestResult<()> {
        let mut batch: Vec<Box<DataPacket>> = Vec::new();
        while self.shared.active.load(Ordering::SeqCst) {
            batch.clear();
            if self.source.try_get_batch(&mut batch) {
                self.shared
                    .buffer_length
                    .store(batch.len(), Ordering::SeqCst);
                *self
                    .shared
                    .buffer_counter
                    .lock()
                    .unwrap()
                    .entry(batch.len())
                    .or_insert(0) += 1;

                for dp in batch.drain(..) {
                    let result = self.process_packet(dp);
                    self.shared.buffer_length.fetch_sub(1, Ordering::SeqCst);
                    result?;
                    if self.shared.force_quit.load(Ordering::SeqCst) {
                        break;
                    }
                }
                // Anything left after a force-quit is released here
                batch.clear();
                self.shared.buffer_length.store(0, Ordering::SeqCst);
            } else {
                thread::sleep(IDLE_SLEEP);
            }
        }
        Ok(())
    }

    fn drain_single(&mut self) -> IngestResult<()> {
        while self.shared.active.load(Ordering::SeqCst) {
            if let Some(dp) = self.source.try_get() {
                self.shared.buffer_length.store(1, Ordering::SeqCst);
                *self
                    .shared
                    .buffer_counter
                    .lock()
                    .unwrap()
                    .entry(1)
                    .or_insert(0) += 1;
                let result = self.process_packet(dp);
                self.shared.buffer_length.store(0, Ordering::SeqCst);
                result?;
            } else {
                thread::sleep(IDLE_SLEEP);
            }
        }
        Ok(())
    }

    fn process_packet(&mut self, dp: Box<DataPacket>) -> IngestResult<()> {
        let started = Instant::now();
        let outcome = self.decoder.parse(
            &dp,
            &mut self.chunks,
            self.source.as_ref(),
            &self.shared.force_quit,
        )?;

        self.shared
            .bytes_processed
            .fetch_add(dp.data.len() as u64, Ordering::Relaxed);
        self.shared
            .events_processed
            .fetch_add(outcome.events, Ordering::Relaxed);
        self.shared
            .fragments_processed
            .fetch_add(outcome.fragments, Ordering::Relaxed);
        self.shared.packets_processed.fetch_add(1, Ordering::Relaxed);

        if outcome.board_fails > 0 {
            *self
                .shared
                .fail_counter
                .lock()
                .unwrap()
                .entry(dp.bid)
                .or_insert(0) += outcome.board_fails;
        }
        if !outcome.data_per_chan.is_empty() {
            let mut dpc = self.shared.data_per_chan.lock().unwrap();
            for (channel, bytes) in &outcome.data_per_chan {
                *dpc.entry(*channel).or_insert(0) += bytes;
            }
        }

        self.shared
            .proc_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        if let Some(smallest) = outcome.smallest_latest_chunk {
            let spent = self.writer.flush(&mut self.chunks, smallest, false);
            self.shared
                .comp_micros
                .fetch_add(spent.as_micros() as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Controller-side handle to a spawned worker
pub struct WorkerHandle {
    tag: String,
    file_tag: String,
    benchmarks_dir: PathBuf,
    shared: Arc<SharedState>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a worker thread reading from `source`
    ///
    /// `tag` must be unique per worker; it becomes part of every output
    /// filename. Fails fast if the output tree cannot be created or the
    /// configured compressor is unavailable.
    pub fn spawn(
        config: Arc<Config>,
        source: Arc<dyn PacketSource>,
        tag: impl Into<String>,
    ) -> IngestResult<Self> {
        let tag = tag.into();
        let hostname = gethostname().to_string_lossy().into_owned();
        let file_tag = format!("{hostname}_{tag}");

        let writer = ChunkWriter::new(&config.strax, file_tag.clone())?;
        let decoder = PacketDecoder::new(source.data_format(), config.clone());
        let chunks = ChunkBuffer::new(
            config.strax.chunk_length_ns(),
            config.strax.chunk_overlap_ns(),
        );
        let benchmarks_dir = config
            .strax
            .output_path
            .join(format!("{}_benchmarks", config.strax.run_identifier));

        let shared = Arc::new(SharedState::default());
        shared.active.store(true, Ordering::SeqCst);

        let worker = Worker {
            config,
            source,
            decoder,
            chunks,
            writer,
            shared: shared.clone(),
            tag: tag.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("ingest-{tag}"))
            .spawn(move || worker.run())?;

        Ok(Self {
            tag,
            file_tag,
            benchmarks_dir,
            shared,
            handle: Some(handle),
        })
    }

    /// Ask the worker to finish draining and flush everything
    pub fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
    }

    /// Abort decoding at the next checkpoint
    pub fn force_quit(&self) {
        self.shared.force_quit.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Packets currently held by the worker
    pub fn buffer_length(&self) -> usize {
        self.shared.buffer_length.load(Ordering::SeqCst)
    }

    /// Fatal error message, if the worker died on one
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal_error.lock().unwrap().clone()
    }

    /// Snapshot of the cumulative counters
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            bytes_processed: self.shared.bytes_processed.load(Ordering::Relaxed),
            fragments_processed: self.shared.fragments_processed.load(Ordering::Relaxed),
            events_processed: self.shared.events_processed.load(Ordering::Relaxed),
            data_packets: self.shared.packets_processed.load(Ordering::Relaxed),
            processing_micros: self.shared.proc_micros.load(Ordering::Relaxed),
            compression_micros: self.shared.comp_micros.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and add its per-board fail counts into `into`
    pub fn close(&self, into: &mut HashMap<i16, u32>) {
        self.stop();
        let counters = self.shared.fail_counter.lock().unwrap();
        for (bid, count) in counters.iter() {
            *into.entry(*bid).or_insert(0) += count;
        }
    }

    /// Drain per-channel byte counts into `into`, resetting them
    pub fn drain_data_per_chan(&self, into: &mut HashMap<i16, u64>) {
        if !self.shared.active.load(Ordering::SeqCst) {
            return;
        }
        let mut dpc = self.shared.data_per_chan.lock().unwrap();
        for (channel, bytes) in dpc.iter_mut() {
            *into.entry(*channel).or_insert(0) += *bytes;
            *bytes = 0;
        }
    }

    /// Stop the worker, wait for it within bounds, persist benchmarks
    ///
    /// Waits up to ten 500 ms rounds for the buffer to drain, then raises
    /// `force_quit` and waits another 2 s, then abandons the thread if it
    /// still has not stopped.
    pub fn shutdown(mut self) -> WorkerStats {
        self.stop();
        info!(
            tag = %self.tag,
            buffered = self.buffer_length(),
            "Waiting for worker to stop"
        );

        for _ in 0..DRAIN_ROUNDS {
            if !self.is_running() {
                break;
            }
            thread::sleep(DRAIN_INTERVAL);
        }
        if self.is_running() {
            warn!(
                tag = %self.tag,
                remaining = self.buffer_length(),
                "Worker taking too long, force-quitting"
            );
            self.force_quit();
            thread::sleep(FORCE_QUIT_GRACE);
        }
        if self.is_running() {
            error!(tag = %self.tag, "Worker still running, abandoning thread");
            drop(self.handle.take());
        } else if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        let stats = self.stats();
        let benchmarks = WorkerBenchmarks {
            worker_tag: self.tag.clone(),
            bytes: stats.bytes_processed,
            fragments: stats.fragments_processed,
            events: stats.events_processed,
            data_packets: stats.data_packets,
            buffer_counter: self.shared.buffer_counter.lock().unwrap().clone(),
            processing_micros: stats.processing_micros,
            compression_micros: stats.compression_micros,
        };
        if let Err(e) = benchmarks.save(&self.benchmarks_dir, &self.file_tag) {
            error!(tag = %self.tag, error = %e, "Failed to save benchmarks");
        }
        stats
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // A handle dropped without shutdown() still stops its worker
        self.shared.active.store(false, Ordering::SeqCst);
    }
}
