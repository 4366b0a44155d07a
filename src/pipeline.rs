use crate::config::{PumpBuilder, PumpConfig};
use crate::drain::Drain;
use crate::error::{fatal, PumpError, Result};
use crate::file::{self, FileSink, FileSource};
use crate::metrics::PumpMetrics;
use crate::scanner::Scanner;
use crate::sort::{SortAdapter, SortEngine, SortPhase};
use crate::state::{BufPos, Signals, State};
use crate::task::{Task, TaskSlot};
use crate::worker::{run_worker, FnPump, PumpFn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Producer-side state: the buffer being filled by `write_input` and the scanner.
#[derive(Debug)]
struct Feeder {
    scanner: Scanner,
    current: Option<Vec<u8>>,
    eof: bool,
}

/// Everything the producer, the workers and the consumers share.
pub(crate) struct Shared {
    pub(crate) config: PumpConfig,
    pub(crate) state: Mutex<State>,
    pub(crate) signals: Signals,
    pub(crate) pump_fn: Option<Box<dyn PumpFn>>,
    pub(crate) sort: Option<SortAdapter>,
    pub(crate) drains: Vec<Mutex<Drain>>,
    /// Reserved for pump functions; the engine never takes it
    pub(crate) user_lock: Mutex<()>,
    pub(crate) metrics: PumpMetrics,
    /// Mirrors `state.error.is_some()` for lock-free checks on hot paths
    failed: AtomicBool,
    feeder: Mutex<Feeder>,
}

impl Shared {
    fn new(
        config: PumpConfig,
        pump_fn: Option<Box<dyn PumpFn>>,
        sort: Option<SortAdapter>,
    ) -> Self {
        let sizes: Vec<usize> = config.outputs.iter().map(|o| o.buf_size).collect();
        let tasks = (0..config.tasks).map(|_| TaskSlot::new(&sizes)).collect();
        let state = State::new(config.in_buffers, tasks, config.num_outputs());
        let drains = (0..config.num_outputs())
            .map(|_| Mutex::new(Drain::default()))
            .collect();
        let feeder = Feeder {
            scanner: Scanner::new(config.record_mode, config.group_by),
            current: None,
            eof: false,
        };
        Self {
            config,
            state: Mutex::new(state),
            signals: Signals::default(),
            pump_fn,
            sort,
            drains,
            user_lock: Mutex::new(()),
            metrics: PumpMetrics::new(),
            failed: AtomicBool::new(false),
            feeder: Mutex::new(feeder),
        }
    }

    /// Latch `err` as the instance error (first one wins) and wake every waiter.
    pub(crate) fn raise(&self, err: PumpError) {
        let mut state = self.state.lock();
        self.raise_locked(&mut state, err);
    }

    pub(crate) fn raise_locked(&self, state: &mut State, err: PumpError) {
        let msg = err.to_string();
        if state.latch(err) {
            self.failed.store(true, Ordering::Release);
            log::debug!("error latched: {msg}");
            self.signals.wake_all();
        }
    }

    /// The latched error, checked without the state lock when there is none.
    pub(crate) fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            self.state.lock().check()
        } else {
            Ok(())
        }
    }

    pub(crate) fn error(&self) -> Option<PumpError> {
        self.state.lock().error.clone()
    }

    pub(crate) fn write_input(&self, data: &[u8]) -> Result<usize> {
        if let Some(sort) = &self.sort {
            return sort.write(self, data);
        }
        if data.is_empty() {
            self.close_input()?;
            return Ok(0);
        }

        let mut guard = self.feeder.lock();
        let feeder = &mut *guard;
        self.check_failed()?;
        if feeder.eof {
            return Err(PumpError::RedundantEof(format!(
                "{} bytes written after input eof",
                data.len()
            )));
        }

        let capacity = self.config.in_buf_size;
        let mut rest = data;
        while !rest.is_empty() {
            if feeder.current.is_none() {
                let index = self.state.lock().buf_readable;
                feeder.current = Some(self.next_in_buf(index)?);
            }
            let Some(buf) = feeder.current.as_mut() else {
                break;
            };
            let n = (capacity - buf.len()).min(rest.len());
            buf.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if buf.len() == capacity {
                if let Some(full) = feeder.current.take() {
                    self.flush(&mut feeder.scanner, full, false)?;
                }
            }
        }
        self.metrics.record_bytes_in(data.len());
        Ok(data.len())
    }

    pub(crate) fn close_input(&self) -> Result<()> {
        if let Some(sort) = &self.sort {
            return sort.close(self);
        }
        let mut guard = self.feeder.lock();
        let feeder = &mut *guard;
        if let Err(err) = self.check_failed() {
            if !feeder.eof {
                feeder.eof = true;
                self.seal_input(&mut self.state.lock());
            }
            return Err(err);
        }
        if feeder.eof {
            log::debug!("ignoring redundant input eof");
            return Ok(());
        }
        feeder.eof = true;
        let result = match feeder.current.take() {
            Some(buf) if !buf.is_empty() => self.flush(&mut feeder.scanner, buf, true),
            _ => {
                self.seal_input(&mut self.state.lock());
                Ok(())
            }
        };
        if feeder.scanner.partial() != 0 {
            log::debug!(
                "input ends inside a record: {} trailing bytes",
                feeder.scanner.partial()
            );
        }
        result
    }

    pub(crate) fn fail_input(&self, msg: String) {
        if let Some(sort) = &self.sort {
            sort.abort(self, msg);
            return;
        }
        // a producer blocked in write_input holds the feeder until woken
        {
            let mut state = self.state.lock();
            self.raise_locked(&mut state, PumpError::Upstream(msg));
            self.seal_input(&mut state);
        }
        let mut feeder = self.feeder.lock();
        feeder.eof = true;
        feeder.current = None;
    }

    pub(crate) fn acquire_in_buf(&self, index: u64) -> Result<Vec<u8>> {
        if self.sort.is_some() {
            return Err(PumpError::SortIncompatible(
                "input buffers cannot be acquired from a sort instance".into(),
            ));
        }
        self.check_failed()?;
        let readable = self.state.lock().buf_readable;
        let ring = self.config.in_buffers as u64;
        if index < readable || index >= readable + ring {
            return Err(PumpError::BufIndex(format!(
                "input buffer {index} is outside the fillable range {readable}..{}",
                readable + ring
            )));
        }
        let mut buf = self.next_in_buf(index)?;
        buf.resize(self.config.in_buf_size, 0);
        Ok(buf)
    }

    pub(crate) fn put_in_buf(&self, index: u64, mut buf: Vec<u8>, bytes: usize, eof: bool) -> Result<()> {
        if self.sort.is_some() {
            return Err(PumpError::SortIncompatible(
                "input buffers cannot be put into a sort instance".into(),
            ));
        }
        let mut guard = self.feeder.lock();
        let feeder = &mut *guard;
        self.check_failed()?;
        if feeder.eof {
            return Err(PumpError::RedundantEof(format!(
                "input buffer {index} put after input eof"
            )));
        }
        let readable = self.state.lock().buf_readable;
        if index != readable {
            return Err(PumpError::BufIndex(format!(
                "input buffer {index} put out of order, expected {readable}"
            )));
        }
        if feeder.current.is_some() {
            return Err(PumpError::BufIndex(format!(
                "input buffer {index} is already being filled by write_input"
            )));
        }
        if bytes > buf.len() {
            return Err(PumpError::BufIndex(format!(
                "{bytes} bytes put into input buffer {index} of {} bytes",
                buf.len()
            )));
        }

        buf.truncate(bytes);
        self.metrics.record_bytes_in(bytes);
        if eof {
            feeder.eof = true;
        }
        if bytes == 0 {
            if eof {
                self.seal_input(&mut self.state.lock());
            }
            return Ok(());
        }
        self.flush(&mut feeder.scanner, buf, eof)
    }

    pub(crate) fn read_output(&self, out: usize, dst: &mut [u8]) -> Result<usize> {
        if let Some(sort) = &self.sort {
            if out != 0 {
                return Err(PumpError::OutputIndex(format!(
                    "a sort instance has a single output, got index {out}"
                )));
            }
            return sort.read(self, dst);
        }
        if out >= self.config.num_outputs() {
            return Err(PumpError::OutputIndex(format!(
                "output index {out} is not less than the number of outputs {}",
                self.config.num_outputs()
            )));
        }
        self.check_failed()?;
        if dst.is_empty() {
            return Ok(0);
        }
        self.drain_output(out, dst)
    }

    /// Wait until input buffer `index` may be refilled and take its storage.
    fn next_in_buf(&self, index: u64) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.in_buf_fillable(index) {
            self.metrics.record_producer_block();
            while state.error.is_none() && !state.in_buf_fillable(index) {
                self.signals.in_buf_done.wait(&mut state);
            }
        }
        state.check()?;
        Ok(state.in_buf_mut(index).reclaim(self.config.in_buf_size))
    }

    /// Make a filled buffer readable and start a task in it if a boundary allows.
    fn flush(&self, scanner: &mut Scanner, buf: Vec<u8>, eof: bool) -> Result<()> {
        let boundary = scanner.scan(&buf);
        let len = buf.len();
        let readers = u32::from(boundary.carried_reader) + u32::from(boundary.task_start.is_some());

        let mut state = self.state.lock();
        let index = state.buf_readable;
        state.in_buf_mut(index).publish(buf, readers);
        state.buf_readable += 1;
        self.signals.in_buf_readable.notify_all();
        log::trace!("flushed input buffer {index}: {len} bytes, {boundary:?}");

        if let Some(offset) = boundary.task_start {
            let begin = BufPos::new(index, offset);
            if state.task_init > 0 {
                let prev = state.slot_of(state.task_init - 1);
                state.tasks[prev].expected_end = Some(begin);
            }
            self.wait_task_slot(&mut state)?;
            let seq = state.task_init;
            let slot = state.slot_of(seq);
            state.tasks[slot].init(seq, begin);
            state.task_init += 1;
            self.signals.task_avail.notify_one();
            log::trace!("task {seq} initialized at {begin:?}");
        }

        if eof {
            self.seal_input(&mut state);
        }
        Ok(())
    }

    /// Wait for a free task slot, verifying every task drained meanwhile.
    fn wait_task_slot(&self, state: &mut MutexGuard<'_, State>) -> Result<()> {
        if !state.task_slot_free() {
            self.metrics.record_producer_block();
            while state.error.is_none() && !state.task_slot_free() {
                self.signals.task_drained.wait(state);
            }
        }
        state.check()?;
        verify_drained(state);
        Ok(())
    }

    /// Declare input EOF: the last task now ends at the end of the last buffer.
    fn seal_input(&self, state: &mut State) {
        if state.input_eof {
            return;
        }
        state.input_eof = true;
        if state.task_init > 0 {
            let last = state.slot_of(state.task_init - 1);
            state.tasks[last].expected_end = Some(BufPos::new(state.buf_readable, 0));
        }
        self.signals.wake_input_eof();
        log::debug!(
            "input eof after {} buffers and {} tasks",
            state.buf_readable,
            state.task_init
        );
    }
}

/// Compare the actual and expected end of every drained, unverified task.
fn verify_drained(state: &mut State) {
    while state.task_done < state.task_drained {
        let slot = &state.tasks[state.slot_of(state.task_done)];
        let Some(expected) = slot.expected_end else {
            break;
        };
        if slot.actual_end != Some(expected) {
            fatal(&format!(
                "task {} ended its input at {:?} but the next task begins at {:?}",
                slot.seq, slot.actual_end, expected
            ));
        }
        log::trace!("task {} verified", slot.seq);
        state.task_done += 1;
    }
}

/// Threads started on behalf of a pump and joined by [`Pump::wait`].
#[derive(Default)]
struct Threads {
    source: Option<FileSource>,
    workers: Vec<JoinHandle<()>>,
    sinks: Vec<FileSink>,
}

impl Threads {
    fn is_empty(&self) -> bool {
        self.source.is_none() && self.workers.is_empty() && self.sinks.is_empty()
    }

    /// Join in pipeline order: source, workers, sinks.
    fn join(self, shared: &Shared) {
        if let Some(source) = self.source {
            if let Err(err) = source.join() {
                log::debug!("input source ended with error: {err}");
            }
        }
        for worker in self.workers {
            if worker.join().is_err() {
                shared.raise(PumpError::PumpFunction("worker thread panicked".into()));
            }
        }
        for sink in self.sinks {
            if let Err(err) = sink.join() {
                log::debug!("output sink ended with error: {err}");
            }
        }
    }
}

/// A running pump instance.
///
/// The caller (or a [`FileSource`]) writes input, worker threads run the pump
/// function over record-aligned tasks, and the caller (or a [`FileSink`] or a
/// [`Link`](crate::Link)) reads each output back in input order.
///
/// # Example
///
/// ```no_run
/// use pump_pipeline::{Pump, Task};
///
/// let pump = Pump::start("THREADS=4", |task: &mut Task<'_>| {
///     let mut rec = Vec::new();
///     while task.read_record(&mut rec)? {
///         task.write(0, &rec.to_ascii_uppercase())?;
///     }
///     Ok(())
/// })?;
/// pump.write_input(b"a\nbb\n")?;
/// pump.close_input()?;
/// let mut out = vec![0u8; 64];
/// let n = pump.read_output(0, &mut out)?;
/// assert_eq!(&out[..n], b"A\nBB\n");
/// pump.wait()?;
/// # Ok::<(), pump_pipeline::PumpError>(())
/// ```
pub struct Pump {
    shared: Arc<Shared>,
    threads: Mutex<Threads>,
}

impl Pump {
    /// Start a pump configured by a directive string.
    pub fn start<F>(directives: &str, f: F) -> Result<Pump>
    where
        F: Fn(&mut Task<'_>) -> Result<()> + Send + Sync + 'static,
    {
        PumpBuilder::new().directives(directives)?.build_fn(f)
    }

    /// Start an instance whose tasks are produced by an external sort engine.
    ///
    /// Records written to the instance are released to the engine; once input
    /// ends, output 0 returns the engine's sorted records.
    pub fn start_sort<E: SortEngine + 'static>(engine: E) -> Result<Pump> {
        let config = PumpBuilder::new()
            .threads(1)
            .tasks(1)
            .in_buffers(1)
            .in_buf_size(4096)
            .config()?;
        let adapter = SortAdapter::new(Box::new(engine));
        log::info!("sort pump started");
        Ok(Pump {
            shared: Arc::new(Shared::new(config, None, Some(adapter))),
            threads: Mutex::new(Threads::default()),
        })
    }

    fn launch(config: PumpConfig, pump_fn: Box<dyn PumpFn>) -> Result<Pump> {
        let source = config
            .in_file
            .as_deref()
            .map(|path| file::open_source(path).map(|reader| (path.to_string(), reader)))
            .transpose()?;
        let sinks = config
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(i, out)| out.file.as_deref().map(|path| (i, path)))
            .map(|(i, path)| file::open_sink(path).map(|writer| (i, path.to_string(), writer)))
            .collect::<Result<Vec<_>>>()?;

        let pump = Pump {
            shared: Arc::new(Shared::new(config, Some(pump_fn), None)),
            threads: Mutex::new(Threads::default()),
        };
        let config = &pump.shared.config;

        for i in 0..config.threads {
            let shared = Arc::clone(&pump.shared);
            let handle = thread::Builder::new()
                .name(format!("pump-worker-{i}"))
                .spawn(move || run_worker(shared, i))
                .map_err(|e| pump.spawn_failed("worker", e))?;
            pump.threads.lock().workers.push(handle);
        }
        if let Some((name, reader)) = source {
            let source = FileSource::spawn_shared(Arc::clone(&pump.shared), name, reader)
                .map_err(|e| pump.raise_returned(e))?;
            pump.threads.lock().source = Some(source);
        }
        for (i, name, writer) in sinks {
            let sink = FileSink::spawn_shared(Arc::clone(&pump.shared), i, name, writer)
                .map_err(|e| pump.raise_returned(e))?;
            pump.threads.lock().sinks.push(sink);
        }

        log::info!(
            "pump started: {} threads, {} tasks, {} input buffers of {} bytes, {} outputs, {:?}",
            config.threads,
            config.tasks,
            config.in_buffers,
            config.in_buf_size,
            config.num_outputs(),
            config.record_mode
        );
        Ok(pump)
    }

    fn spawn_failed(&self, what: &str, err: std::io::Error) -> PumpError {
        self.raise_returned(PumpError::Config(format!("failed to spawn {what} thread: {err}")))
    }

    fn raise_returned(&self, err: PumpError) -> PumpError {
        self.shared.raise(err.clone());
        err
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// The validated configuration of this instance
    pub fn config(&self) -> &PumpConfig {
        &self.shared.config
    }

    /// Number of outputs
    pub fn num_outputs(&self) -> usize {
        self.shared.config.num_outputs()
    }

    /// Whether this is a sort instance
    pub fn is_sort(&self) -> bool {
        self.shared.sort.is_some()
    }

    /// Whether output 0 carries key-difference prefixes (sort instances only)
    pub fn key_diff_output(&self) -> bool {
        self.shared.sort.as_ref().map_or(false, |s| s.key_diff())
    }

    /// Phase of a sort instance, `None` for a regular pump
    pub fn sort_phase(&self) -> Option<SortPhase> {
        self.shared
            .sort
            .as_ref()
            .map(|_| self.shared.state.lock().sort_phase)
    }

    /// Append bytes to the input stream; an empty slice declares EOF.
    ///
    /// Blocks while every input buffer is in use. Returns the number of bytes
    /// accepted, which is all of them unless an error is returned.
    pub fn write_input(&self, data: &[u8]) -> Result<usize> {
        self.shared.write_input(data)
    }

    /// Declare input EOF.
    ///
    /// A repeated declaration is ignored unless an error is latched, in which
    /// case that error is returned like from every other call.
    pub fn close_input(&self) -> Result<()> {
        self.shared.close_input()
    }

    /// Declare input EOF because the upstream producer failed.
    ///
    /// Latches an upstream error so every consumer returns instead of waiting
    /// for input that will never come.
    pub fn fail_input(&self, msg: impl Into<String>) {
        self.shared.fail_input(msg.into());
    }

    /// Take the storage of input buffer `index` for filling.
    ///
    /// `index` must lie in `[readable, readable + in_buffers)` where `readable`
    /// is the next buffer to be put. The returned vector is sized to the input
    /// buffer capacity; fill a prefix and hand it back with [`Pump::put_in_buf`].
    pub fn acquire_in_buf(&self, index: u64) -> Result<Vec<u8>> {
        self.shared.acquire_in_buf(index)
    }

    /// Commit the first `bytes` bytes of `buf` as input buffer `index`.
    ///
    /// Buffers must be put in index order. `eof` declares the end of input
    /// after this buffer; `bytes == 0` with `eof` declares EOF alone.
    pub fn put_in_buf(&self, index: u64, buf: Vec<u8>, bytes: usize, eof: bool) -> Result<()> {
        self.shared.put_in_buf(index, buf, bytes, eof)
    }

    /// Read up to `dst.len()` bytes of output `index`, in task order.
    ///
    /// Blocks until bytes are available. Returns `Ok(0)` at end of output, or
    /// when `dst` is empty.
    pub fn read_output(&self, index: usize, dst: &mut [u8]) -> Result<usize> {
        self.shared.read_output(index, dst)
    }

    /// Wait for the instance to finish: the input source, every worker and
    /// every output sink.
    ///
    /// Outputs without a sink must be drained by the caller, otherwise the
    /// workers never finish. Returns the latched error, if any.
    ///
    /// Only the threads started from `IN_FILE=`/`OUT_FILE[i]=` directives are
    /// joined here. A [`FileSource`] or [`FileSink`] created through its own
    /// `open`, `create` or `spawn` belongs to the caller, who must `join` it;
    /// a sink may still be writing when `wait` returns.
    pub fn wait(&self) -> Result<()> {
        if let Some(sort) = &self.shared.sort {
            return sort.wait(&self.shared);
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        threads.join(&self.shared);

        let mut state = self.shared.state.lock();
        if state.error.is_none() {
            verify_drained(&mut state);
        }
        state.check()?;
        log::debug!(
            "pump finished: {}",
            self.shared.metrics.snapshot().format()
        );
        Ok(())
    }

    /// The latched error, if any
    pub fn error(&self) -> Option<PumpError> {
        self.shared.error()
    }

    /// Message of the latched error, or a description of the "no error" code
    pub fn error_message(&self) -> String {
        match self.error() {
            Some(err) => err.to_string(),
            None => PumpError::describe_code(0).to_string(),
        }
    }

    /// Counters and latencies of this instance
    pub fn metrics(&self) -> &PumpMetrics {
        &self.shared.metrics
    }

    /// Statistics reported by the sort engine, `None` for a regular pump
    pub fn sort_stats(&self) -> Option<String> {
        self.shared.sort.as_ref().map(|s| s.stats(&self.shared))
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        let threads = std::mem::take(self.threads.get_mut());
        if threads.is_empty() {
            return;
        }
        log::debug!("pump dropped with threads still running, shutting down");
        self.shared
            .raise(PumpError::Upstream("pump dropped before completion".into()));
        threads.join(&self.shared);
    }
}

impl PumpBuilder {
    /// Validate the configuration and start a pump running `pump_fn`
    pub fn build<P: PumpFn>(self, pump_fn: P) -> Result<Pump> {
        let config = self.config()?;
        Pump::launch(config, Box::new(pump_fn))
    }

    /// Validate the configuration and start a pump running closure `f`
    pub fn build_fn<F>(self, f: F) -> Result<Pump>
    where
        F: Fn(&mut Task<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.build(FnPump::new("pump", f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::PassthroughPump;

    fn drain_all(pump: &Pump, out: usize) -> Vec<u8> {
        let mut result = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = pump.read_output(out, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            result.extend_from_slice(&buf[..n]);
        }
        result
    }

    #[test]
    fn test_passthrough_round_trip() {
        let pump = PumpBuilder::new()
            .threads(2)
            .in_buf_size(8)
            .build(PassthroughPump)
            .unwrap();
        let input = b"one\ntwo\nthree\nfour\nfive\n";
        assert_eq!(pump.write_input(input).unwrap(), input.len());
        pump.close_input().unwrap();
        assert_eq!(drain_all(&pump, 0), input.to_vec());
        pump.wait().unwrap();
        assert_eq!(pump.metrics().total_bytes_in(), input.len() as u64);
        assert_eq!(pump.metrics().total_bytes_out(), input.len() as u64);
    }

    #[test]
    fn test_empty_input() {
        let pump = PumpBuilder::new().threads(2).build(PassthroughPump).unwrap();
        pump.close_input().unwrap();
        assert!(drain_all(&pump, 0).is_empty());
        pump.wait().unwrap();
        assert_eq!(pump.metrics().total_tasks(), 0);
    }

    #[test]
    fn test_redundant_eof_is_ignored() {
        let pump = PumpBuilder::new().threads(1).build(PassthroughPump).unwrap();
        pump.write_input(b"x\n").unwrap();
        assert_eq!(pump.write_input(b"").unwrap(), 0);
        assert_eq!(pump.write_input(b"").unwrap(), 0);
        pump.close_input().unwrap();
        let err = pump.write_input(b"late\n").unwrap_err();
        assert!(matches!(err, PumpError::RedundantEof(_)));
        assert_eq!(drain_all(&pump, 0), b"x\n".to_vec());
        pump.wait().unwrap();
        assert!(pump.error().is_none());
    }

    #[test]
    fn test_output_index_out_of_range() {
        let pump = PumpBuilder::new().threads(1).build(PassthroughPump).unwrap();
        let mut buf = [0u8; 4];
        let err = pump.read_output(1, &mut buf).unwrap_err();
        assert!(matches!(err, PumpError::OutputIndex(_)));
        pump.close_input().unwrap();
        pump.wait().unwrap();
    }

    #[test]
    fn test_error_message_without_error() {
        let pump = PumpBuilder::new().threads(1).build(PassthroughPump).unwrap();
        assert_eq!(pump.error_message(), "no error");
        pump.close_input().unwrap();
        pump.wait().unwrap();
    }

    #[test]
    fn test_drop_without_wait_does_not_hang() {
        let pump = PumpBuilder::new().threads(2).build(PassthroughPump).unwrap();
        pump.write_input(b"abc\n").unwrap();
        drop(pump);
    }
}
