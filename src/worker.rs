use crate::config::RecordMode;
use crate::error::{PumpError, Result};
use crate::pipeline::Shared;
use crate::task::{Claim, OutBuf, Task};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// User logic run by the worker pool against each task.
///
/// In record modes the function is invoked repeatedly until the task's input
/// is exhausted; each invocation may read any number of records (at least
/// one) and write to any output. In whole-buffer mode it is invoked exactly
/// once per task. Invocations for different tasks run concurrently.
pub trait PumpFn: Send + Sync + 'static {
    /// Process part of a task
    fn pump(&self, task: &mut Task<'_>) -> Result<()>;

    /// Get a human-readable name for this pump function
    fn name(&self) -> &str {
        "pump"
    }
}

/// A pump function built from a closure
pub struct FnPump<F>
where
    F: Fn(&mut Task<'_>) -> Result<()> + Send + Sync + 'static,
{
    name: String,
    func: F,
}

impl<F> FnPump<F>
where
    F: Fn(&mut Task<'_>) -> Result<()> + Send + Sync + 'static,
{
    /// Create a new named closure pump function
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> PumpFn for FnPump<F>
where
    F: Fn(&mut Task<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn pump(&self, task: &mut Task<'_>) -> Result<()> {
        (self.func)(task)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> fmt::Debug for FnPump<F>
where
    F: Fn(&mut Task<'_>) -> Result<()> + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPump").field("name", &self.name).finish()
    }
}

/// Copies every record to output 0 unchanged
#[derive(Debug, Default)]
pub struct PassthroughPump;

impl PumpFn for PassthroughPump {
    fn pump(&self, task: &mut Task<'_>) -> Result<()> {
        let mut rec = Vec::new();
        while task.read_record(&mut rec)? {
            task.write(0, &rec)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Main loop of a worker thread: claim tasks until input is exhausted or an
/// error is latched.
pub(crate) fn run_worker(shared: Arc<Shared>, index: usize) {
    let Some(pump) = shared.pump_fn.as_deref() else {
        return;
    };
    log::debug!("worker {index} starting");
    while let Some(claim) = claim_task(&shared, index) {
        run_task(&shared, pump, claim, index);
    }
    log::debug!("worker {index} exiting");
}

fn claim_task(shared: &Shared, worker: usize) -> Option<Claim> {
    let mut state = shared.state.lock();
    while !state.task_claimable() && !state.tasks_exhausted() && state.error.is_none() {
        shared.signals.task_avail.wait(&mut state);
    }
    if state.error.is_some() || !state.task_claimable() {
        return None;
    }

    let seq = state.task_begun;
    state.task_begun += 1;
    let slot = state.slot_of(seq);
    let begin = state.tasks[slot].begin;
    let data = Arc::clone(&state.in_buf(begin.index).data);

    let task_slot = &mut state.tasks[slot];
    task_slot.worker = worker;
    let outs = task_slot
        .outs
        .iter_mut()
        .zip(&shared.config.outputs)
        .map(|(out, cfg)| out.buf.take().unwrap_or_else(|| OutBuf::new(cfg.buf_size)))
        .collect();
    log::trace!("worker {worker} claimed task {seq} at {begin:?}");

    Some(Claim {
        seq,
        slot,
        begin,
        data,
        outs,
    })
}

fn run_task(shared: &Shared, pump: &dyn PumpFn, claim: Claim, worker: usize) {
    let started = Instant::now();
    let mut task = Task::new(shared, claim, worker);
    let outcome = if shared.config.record_mode == RecordMode::WholeBuffer {
        invoke(shared, pump, &mut task).map(|()| task.finish_whole_buffer())
    } else {
        drive_records(shared, pump, &mut task)
    };
    if let Err(err) = outcome {
        log::debug!("task {} failed: {}", task.task_number(), err);
        shared.raise(err);
    }
    shared.metrics.record_task(started.elapsed());
    finish_task(shared, task);
}

fn drive_records(shared: &Shared, pump: &dyn PumpFn, task: &mut Task<'_>) -> Result<()> {
    while task.has_more_input()? {
        shared.check_failed()?;
        task.begin_invocation();
        let before = task.progress();
        invoke(shared, pump, task)?;
        if task.progress() == before && !task.is_input_eof() {
            return Err(task.fail(format!(
                "{} returned without reading any input in task {}",
                pump.name(),
                task.task_number()
            )));
        }
    }
    Ok(())
}

fn invoke(shared: &Shared, pump: &dyn PumpFn, task: &mut Task<'_>) -> Result<()> {
    shared.metrics.record_invocation();
    let result = panic::catch_unwind(AssertUnwindSafe(|| pump.pump(task)));
    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(PumpError::PumpFunction(format!(
            "{} panicked in task {}",
            pump.name(),
            task.task_number()
        ))),
    }
}

/// Return the task's output buffers to its slot and mark its outputs final.
fn finish_task(shared: &Shared, mut task: Task<'_>) {
    let slot = task.slot();
    let seq = task.task_number();
    let end = task.end_pos();
    let records = task.records();
    let outs = task.take_outputs();
    drop(task);

    let mut state = shared.state.lock();
    let task_slot = &mut state.tasks[slot];
    for (out, buf) in task_slot.outs.iter_mut().zip(outs) {
        out.buf = Some(buf);
    }
    task_slot.actual_end = Some(end);
    task_slot.output_eof = true;
    shared.signals.output_ready.notify_all();
    log::trace!("task {seq} output eof after {records} records, input ended at {end:?}");
}
