//! Shared plumbing: error types, CLI arguments, benchmark persistence

pub mod benchmarks;
pub mod cli;
pub mod error;

pub use benchmarks::WorkerBenchmarks;
pub use cli::{CommonArgs, IngesterArgs};
pub use error::{IngestError, IngestResult};
