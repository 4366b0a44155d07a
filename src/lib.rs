//! A parallel data pump: split a byte stream into record-aligned tasks, run a
//! pump function over them on a worker pool, and read the outputs back in
//! input order.
//!
//! Reading input, running pump functions and draining outputs all overlap.
//! Memory stays bounded: the producer blocks when every input buffer or task
//! slot is in use, and a worker stalls when a task's output buffer is full
//! until the consumer empties it.
//!
//! # Features
//!
//! - Newline (or any single byte) delimited, fixed-size and whole-buffer input
//! - Key-grouped input so a reduce group never straddles two tasks
//! - Any number of outputs per pump, each served in strict task order
//! - Sort instances driven by a [`SortEngine`], with an in-memory [`MemorySort`]
//! - [`Link`] threads composing pumps into map → sort → reduce pipelines
//! - File source and sink threads, configurable with `IN_FILE=`/`OUT_FILE[i]=`
//! - A first-error-wins error latch that unblocks every waiting thread
//! - Per-instance metrics: throughput, stalls, task duration quantiles
//!
//! # Example
//!
//! ```no_run
//! use pump_pipeline::{PumpBuilder, Task};
//!
//! let pump = PumpBuilder::new()
//!     .threads(4)
//!     .outputs(2)
//!     .build_fn(|task: &mut Task<'_>| {
//!         let mut rec = Vec::new();
//!         while task.read_record(&mut rec)? {
//!             let out = if rec.starts_with(b"#") { 1 } else { 0 };
//!             task.write(out, &rec)?;
//!         }
//!         Ok(())
//!     })?;
//!
//! pump.write_input(b"#comment\nvalue\n")?;
//! pump.close_input()?;
//! // drain outputs 0 and 1, for example with FileSink threads
//! # Ok::<(), pump_pipeline::PumpError>(())
//! ```

pub mod buffer;
pub mod comparator;
pub mod config;
mod drain;
pub mod error;
pub mod file;
pub mod link;
pub mod metrics;
pub mod pipeline;
mod scanner;
pub mod sort;
mod state;
pub mod task;
pub mod worker;

// Re-exports for convenience
pub use buffer::InputChunk;
pub use config::{OutBufSize, OutputConfig, PumpBuilder, PumpConfig, RecordMode};
pub use error::{PumpError, Result};
pub use file::{FileSink, FileSource};
pub use link::Link;
pub use metrics::{MetricsSnapshot, PumpMetrics};
pub use pipeline::Pump;
pub use sort::{MemorySort, SortEngine, SortPhase, SortReturn};
pub use task::Task;
pub use worker::{FnPump, PassthroughPump, PumpFn};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
