//! The single guarded state of a pump instance.
//!
//! Six monotonically increasing counters drive every wait in the engine:
//!
//! | counter        | advanced by                                       |
//! |----------------|---------------------------------------------------|
//! | `buf_readable` | producer, when a filled buffer is flushed          |
//! | `buf_done`     | producer, when every reader of a buffer finished   |
//! | `task_init`    | producer, when a task boundary is found            |
//! | `task_begun`   | worker, when it claims a task                      |
//! | `task_drained` | consumer, when a task is drained on every output   |
//! | `task_done`    | producer, when a drained task's end is verified    |
//!
//! # Invariants
//!
//! - `task_done <= task_drained <= task_begun <= task_init`
//! - `task_init - task_drained <= tasks.len()`
//! - `buf_done <= buf_readable <= buf_done + in_bufs.len()`
//! - `out_drained[i] <= task_begun` for every output `i`
//! - once `error` is set it is never replaced
//!
//! Each blocking wait is a loop over one of the named predicates below plus
//! the sticky error, paired with exactly one condition variable in
//! [`Signals`].

use crate::buffer::InBuf;
use crate::error::PumpError;
use crate::sort::SortPhase;
use crate::task::TaskSlot;
use parking_lot::Condvar;

/// Position in the input stream: a buffer sequence number and an offset in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct BufPos {
    pub(crate) index: u64,
    pub(crate) offset: usize,
}

impl BufPos {
    pub(crate) fn new(index: u64, offset: usize) -> Self {
        Self { index, offset }
    }
}

#[derive(Debug)]
pub(crate) struct State {
    pub(crate) buf_readable: u64,
    pub(crate) buf_done: u64,
    pub(crate) task_init: u64,
    pub(crate) task_begun: u64,
    pub(crate) task_drained: u64,
    pub(crate) task_done: u64,
    /// Tasks fully drained, per output
    pub(crate) out_drained: Vec<u64>,
    pub(crate) input_eof: bool,
    pub(crate) error: Option<PumpError>,
    pub(crate) in_bufs: Vec<InBuf>,
    pub(crate) tasks: Vec<TaskSlot>,
    pub(crate) sort_phase: SortPhase,
}

impl State {
    pub(crate) fn new(in_bufs: usize, tasks: Vec<TaskSlot>, outputs: usize) -> Self {
        Self {
            buf_readable: 0,
            buf_done: 0,
            task_init: 0,
            task_begun: 0,
            task_drained: 0,
            task_done: 0,
            out_drained: vec![0; outputs],
            input_eof: false,
            error: None,
            in_bufs: (0..in_bufs).map(|_| InBuf::default()).collect(),
            tasks,
            sort_phase: SortPhase::Input,
        }
    }

    /// Latch `err` unless an earlier error holds the slot. Returns whether it was latched.
    pub(crate) fn latch(&mut self, err: PumpError) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(err);
        true
    }

    /// The latched error, if any, as a ready-made `Err`.
    pub(crate) fn check(&self) -> crate::error::Result<()> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn in_buf(&self, index: u64) -> &InBuf {
        &self.in_bufs[(index % self.in_bufs.len() as u64) as usize]
    }

    pub(crate) fn in_buf_mut(&mut self, index: u64) -> &mut InBuf {
        let n = self.in_bufs.len() as u64;
        &mut self.in_bufs[(index % n) as usize]
    }

    pub(crate) fn slot_of(&self, seq: u64) -> usize {
        (seq % self.tasks.len() as u64) as usize
    }

    // Predicates, one per wait site.

    /// Producer: the buffer with sequence number `index` may be (re)filled.
    ///
    /// Retires fully-read buffers from the front of the ring as a side effect,
    /// which is why it takes `&mut self`.
    pub(crate) fn in_buf_fillable(&mut self, index: u64) -> bool {
        let ring = self.in_bufs.len() as u64;
        while index >= self.buf_done + ring {
            if !self.in_buf(self.buf_done).is_released() {
                return false;
            }
            self.buf_done += 1;
        }
        true
    }

    /// Producer: a task slot is free for a new task.
    pub(crate) fn task_slot_free(&self) -> bool {
        self.task_init - self.task_drained < self.tasks.len() as u64
    }

    /// Worker: an initialized task is waiting to be claimed.
    pub(crate) fn task_claimable(&self) -> bool {
        self.task_begun < self.task_init
    }

    /// Worker: input has ended and every task has been claimed.
    pub(crate) fn tasks_exhausted(&self) -> bool {
        self.input_eof && self.task_begun == self.task_init
    }

    /// Worker: the buffer with sequence number `index` is readable, or never will be.
    pub(crate) fn in_buf_readable(&self, index: u64) -> bool {
        index < self.buf_readable || self.input_eof
    }

    /// Consumer: no task can ever produce more bytes for output `out`.
    pub(crate) fn output_at_eof(&self, out: usize) -> bool {
        self.input_eof
            && self.task_init == self.task_begun
            && self.task_begun == self.out_drained[out]
    }

    /// Consumer: the oldest undrained task for output `out` is stalled or finished.
    pub(crate) fn output_has_data(&self, out: usize) -> bool {
        let seq = self.out_drained[out];
        if seq >= self.task_begun {
            return false;
        }
        let slot = &self.tasks[self.slot_of(seq)];
        slot.output_eof || slot.outs[out].stalled
    }

    /// Worker: the consumer emptied a stalled output buffer.
    pub(crate) fn output_emptied(&self, slot: usize, out: usize) -> bool {
        !self.tasks[slot].outs[out].stalled
    }
}

/// Condition variables, one per wait predicate family.
#[derive(Debug, Default)]
pub(crate) struct Signals {
    /// `in_buf_readable`: a flushed buffer or input EOF
    pub(crate) in_buf_readable: Condvar,
    /// `in_buf_fillable`: a buffer's last reader finished
    pub(crate) in_buf_done: Condvar,
    /// `task_claimable` / `tasks_exhausted`
    pub(crate) task_avail: Condvar,
    /// `task_slot_free`
    pub(crate) task_drained: Condvar,
    /// `output_has_data` / `output_at_eof`, and sort phase changes
    pub(crate) output_ready: Condvar,
    /// `output_emptied`
    pub(crate) output_empty: Condvar,
}

impl Signals {
    /// Wake every waiter so it can observe a latched error.
    pub(crate) fn wake_all(&self) {
        self.in_buf_readable.notify_all();
        self.in_buf_done.notify_all();
        self.task_avail.notify_all();
        self.task_drained.notify_all();
        self.output_ready.notify_all();
        self.output_empty.notify_all();
    }

    /// Wake everyone who cares about input EOF.
    pub(crate) fn wake_input_eof(&self) {
        self.in_buf_readable.notify_all();
        self.task_avail.notify_all();
        self.output_ready.notify_all();
    }
}
