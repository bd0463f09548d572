//! Ingester binary - runs emulated digitizer packets through the pipeline
//!
//! Usage:
//!   cargo run --bin ingester -- --config config.toml --workers 4
//!   cargo run --bin ingester -- --packets 1000 -o ./strax_data --run-id run_001

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strax_ingest::common::IngesterArgs;
use strax_ingest::config::{BoardEntry, BoardFormat, Config};
use strax_ingest::ingest::WorkerHandle;
use strax_ingest::source::emulator::{EmulatorConfig, EmulatorSource};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("strax_ingest=info".parse()?),
        )
        .init();

    let args = IngesterArgs::parse();

    let mut config = if std::path::Path::new(&args.common.config_file).exists() {
        let config = Config::load(&args.common.config_file)?;
        info!(config_file = %args.common.config_file, "Loaded configuration");
        config
    } else {
        warn!(
            config_file = %args.common.config_file,
            "Config file not found, using defaults"
        );
        Config::default()
    };

    if let Some(output) = args.output {
        config.strax.output_path = PathBuf::from(output);
    }
    if let Some(run_id) = args.run_identifier {
        config.strax.run_identifier = run_id;
    }
    if config.boards.is_empty() {
        // Demo board matching the emulator defaults
        config
            .boards
            .push(BoardEntry::new(100, BoardFormat::v1724(), (0..16).collect()));
    }
    let config = Arc::new(config);

    info!(
        output = %config.strax.output_path.display(),
        run = %config.strax.run_identifier,
        chunk_ns = config.strax.chunk_length_ns(),
        overlap_ns = config.strax.chunk_overlap_ns(),
        workers = args.workers,
        packets = args.packets,
        "Starting ingestion"
    );

    let board = &config.boards[0];
    let mut emulator = EmulatorSource::new(EmulatorConfig {
        bid: board.id,
        format: board.format.clone(),
        ..Default::default()
    });
    emulator.fill(args.packets);
    let source = Arc::new(emulator);

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.workers);
    for i in 0..args.workers {
        handles.push(WorkerHandle::spawn(
            config.clone(),
            source.clone(),
            i.to_string(),
        )?);
    }

    // Wait for the queue to drain, then for workers to let go of their buffers
    while source.pending() > 0 || handles.iter().any(|h| h.buffer_length() > 0) {
        if handles.iter().any(|h| h.fatal_error().is_some()) {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    let mut fail_counters: HashMap<i16, u32> = HashMap::new();
    let mut data_per_chan: HashMap<i16, u64> = HashMap::new();
    let mut total_bytes = 0u64;
    let mut total_fragments = 0u64;
    let mut total_events = 0u64;

    for handle in handles {
        handle.drain_data_per_chan(&mut data_per_chan);
        handle.close(&mut fail_counters);
        if let Some(error) = handle.fatal_error() {
            warn!(error = %error, "Worker died before shutdown");
        }
        let stats = handle.shutdown();
        total_bytes += stats.bytes_processed;
        total_fragments += stats.fragments_processed;
        total_events += stats.events_processed;
    }

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        bytes = total_bytes,
        events = total_events,
        fragments = total_fragments,
        channels_seen = data_per_chan.len(),
        board_fails = fail_counters.values().sum::<u32>(),
        "Ingestion complete"
    );
    Ok(())
}
