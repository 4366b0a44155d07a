//! Tasks: the ring slots the engine tracks, and the [`Task`] handle a pump
//! function works through.
//!
//! A task starts at a record boundary found by the scanner and discovers its
//! own end by reading: in ungrouped modes it stops after the first record that
//! begins beyond its first input buffer would be read, in grouped mode at the
//! first new key group found past its first buffer. The producer
//! independently computes where the task should have stopped; the two
//! positions are compared once the task is drained.

use crate::buffer::InputChunk;
use crate::config::RecordMode;
use crate::error::{PumpError, Result};
use crate::pipeline::Shared;
use crate::scanner::key_offset;
use crate::state::BufPos;
use memchr::memchr;
use parking_lot::MutexGuard;
use std::fmt;
use std::sync::Arc;

/// A per-task staging buffer for one output.
#[derive(Debug, Default)]
pub(crate) struct OutBuf {
    data: Box<[u8]>,
    used: usize,
}

impl OutBuf {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    pub(crate) fn filled(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    pub(crate) fn clear(&mut self) {
        self.used = 0;
    }

    /// Copy as much of `bytes` as fits; returns the count copied.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len() - self.used);
        self.data[self.used..self.used + n].copy_from_slice(&bytes[..n]);
        self.used += n;
        n
    }
}

/// One output of a task slot as seen by the consumer.
#[derive(Debug, Default)]
pub(crate) struct TaskOut {
    /// Present whenever the worker is not writing into it
    pub(crate) buf: Option<OutBuf>,
    /// The worker filled the buffer and waits for it to be emptied
    pub(crate) stalled: bool,
}

/// A slot of the task ring.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    pub(crate) seq: u64,
    pub(crate) begin: BufPos,
    pub(crate) expected_end: Option<BufPos>,
    pub(crate) actual_end: Option<BufPos>,
    pub(crate) outs: Vec<TaskOut>,
    pub(crate) output_eof: bool,
    pub(crate) outs_drained: usize,
    pub(crate) worker: usize,
}

impl TaskSlot {
    pub(crate) fn new(out_sizes: &[usize]) -> Self {
        Self {
            seq: 0,
            begin: BufPos::default(),
            expected_end: None,
            actual_end: None,
            outs: out_sizes
                .iter()
                .map(|&size| TaskOut {
                    buf: Some(OutBuf::new(size)),
                    stalled: false,
                })
                .collect(),
            output_eof: false,
            outs_drained: 0,
            worker: 0,
        }
    }

    /// Reset the slot for task `seq` beginning at `begin`.
    pub(crate) fn init(&mut self, seq: u64, begin: BufPos) {
        self.seq = seq;
        self.begin = begin;
        self.expected_end = None;
        self.actual_end = None;
        for out in &mut self.outs {
            if let Some(buf) = out.buf.as_mut() {
                buf.clear();
            }
            out.stalled = false;
        }
        self.output_eof = false;
        self.outs_drained = 0;
    }
}

/// What a worker takes out of the ring when it claims a task.
#[derive(Debug)]
pub(crate) struct Claim {
    pub(crate) seq: u64,
    pub(crate) slot: usize,
    pub(crate) begin: BufPos,
    pub(crate) data: Arc<Vec<u8>>,
    pub(crate) outs: Vec<OutBuf>,
}

/// Handle through which a pump function reads its task's input and writes its outputs.
///
/// A handle is only valid for the duration of one pump function invocation.
pub struct Task<'a> {
    shared: &'a Shared,
    seq: u64,
    slot: usize,
    worker: usize,
    buf_index: u64,
    data: Option<Arc<Vec<u8>>>,
    pos: usize,
    first_in_buf: bool,
    first_group_rec: bool,
    input_eof: bool,
    outs: Vec<OutBuf>,
    scratch: String,
    records: u64,
}

impl<'a> Task<'a> {
    pub(crate) fn new(shared: &'a Shared, claim: Claim, worker: usize) -> Self {
        Self {
            shared,
            seq: claim.seq,
            slot: claim.slot,
            worker,
            buf_index: claim.begin.index,
            data: Some(claim.data),
            pos: claim.begin.offset,
            first_in_buf: true,
            first_group_rec: true,
            input_eof: false,
            outs: claim.outs,
            scratch: String::new(),
            records: 0,
        }
    }

    /// Index of the worker thread running this task, in `0..threads`
    pub fn worker_index(&self) -> usize {
        self.worker
    }

    /// Sequence number of this task; strictly increasing in input order
    pub fn task_number(&self) -> u64 {
        self.seq
    }

    /// Number of outputs the pump was configured with
    pub fn num_outputs(&self) -> usize {
        self.outs.len()
    }

    /// Lock the per-instance mutex reserved for pump functions.
    ///
    /// The engine never holds this lock itself.
    pub fn user_lock(&self) -> MutexGuard<'a, ()> {
        self.shared.user_lock.lock()
    }

    /// Read the next record of this task into `rec`.
    ///
    /// Returns `Ok(false)` when the task's input is exhausted or, in grouped
    /// mode, when the current key group ends. Delimited records keep their
    /// delimiter; grouped records are returned without their prefix byte.
    pub fn read_record(&mut self, rec: &mut Vec<u8>) -> Result<bool> {
        rec.clear();
        if self.input_eof {
            return Ok(false);
        }
        let mode = self.shared.config.record_mode;
        let group_by = self.shared.config.group_by;

        if mode == RecordMode::WholeBuffer {
            let chunk = self.take_input()?;
            rec.extend_from_slice(&chunk);
            return Ok(!chunk.is_empty());
        }

        if self.pos >= self.cur_len() {
            self.done_reading(true);
            if group_by.is_none() {
                self.input_eof = true;
                return Ok(false);
            }
            self.ready_in_buf()?;
            if self.input_eof {
                return Ok(false);
            }
        }

        match group_by {
            Some(keys) => {
                if key_offset(self.byte_at(self.pos)) < keys {
                    if !self.first_in_buf {
                        self.end_input_here();
                        return Ok(false);
                    }
                    if !self.first_group_rec {
                        return Ok(false);
                    }
                }
                self.pos += 1;
            }
            None if !self.first_in_buf => {
                self.end_input_here();
                return Ok(false);
            }
            None => {}
        }
        self.first_group_rec = false;

        self.copy_record(mode, group_by.is_some(), rec)?;
        self.records += 1;
        self.shared.metrics.record_records(1);
        Ok(true)
    }

    /// Take the unread remainder of the task's input buffer.
    ///
    /// Only available in whole-buffer mode. Record-mode tasks end on record
    /// boundaries, so they must use [`Task::read_record`]; calling this there
    /// latches a pump function error.
    pub fn take_input(&mut self) -> Result<InputChunk> {
        if self.shared.config.record_mode != RecordMode::WholeBuffer {
            return Err(self.fail(format!(
                "take_input called in task {} outside whole-buffer mode",
                self.seq
            )));
        }
        if self.input_eof {
            return Ok(InputChunk::default());
        }
        match &self.data {
            Some(data) => {
                let chunk = InputChunk::new(Arc::clone(data), self.pos..data.len());
                self.pos = data.len();
                Ok(chunk)
            }
            None => Ok(InputChunk::default()),
        }
    }

    /// Writable window at the end of output `out`'s staging buffer.
    ///
    /// Blocks until the consumer empties the buffer when it is full. Follow
    /// with [`Task::commit`] to publish the bytes written.
    pub fn output_window(&mut self, out: usize) -> Result<&mut [u8]> {
        self.check_out(out)?;
        if self.outs[out].is_full() {
            self.stall(out)?;
        }
        Ok(self.outs[out].spare_mut())
    }

    /// Publish `n` bytes written into the window from [`Task::output_window`].
    pub fn commit(&mut self, out: usize, n: usize) -> Result<()> {
        self.check_out(out)?;
        let spare = self.outs[out].capacity() - self.outs[out].used();
        if n > spare {
            return Err(self.fail(format!(
                "committed {n} bytes to output {out} but only {spare} were available"
            )));
        }
        self.outs[out].used += n;
        Ok(())
    }

    /// Append `bytes` to output `out`, stalling while the consumer catches up.
    pub fn write(&mut self, out: usize, bytes: &[u8]) -> Result<usize> {
        self.check_out(out)?;
        let mut rest = bytes;
        loop {
            let n = self.outs[out].push(rest);
            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
            self.stall(out)?;
        }
        Ok(bytes.len())
    }

    /// Append formatted text to output `out`.
    ///
    /// ```ignore
    /// task.write_fmt(0, format_args!("{key}\t{count}\n"))?;
    /// ```
    pub fn write_fmt(&mut self, out: usize, args: fmt::Arguments<'_>) -> Result<usize> {
        let mut text = std::mem::take(&mut self.scratch);
        text.clear();
        if fmt::Write::write_fmt(&mut text, args).is_err() {
            self.scratch = text;
            return Err(self.fail("formatting pump function output failed"));
        }
        let written = self.write(out, text.as_bytes());
        self.scratch = text;
        written
    }

    /// Raise a pump function error.
    ///
    /// The error is latched for the whole instance (unless an earlier one holds
    /// the slot) and every blocked thread is woken. Return it from the pump
    /// function.
    pub fn fail(&self, msg: impl Into<String>) -> PumpError {
        let err = PumpError::PumpFunction(msg.into());
        self.shared.raise(err.clone());
        err
    }

    // Engine side.

    /// Whether the pump function should be invoked again for this task.
    pub(crate) fn has_more_input(&mut self) -> Result<bool> {
        if self.input_eof {
            return Ok(false);
        }
        let group_by = self.shared.config.group_by;

        // past the first buffer an ungrouped task only finishes its last record
        if !self.first_in_buf && group_by.is_none() {
            let at_end = self.pos >= self.cur_len();
            self.done_reading(at_end);
            self.input_eof = true;
            return Ok(false);
        }
        if self.pos < self.cur_len() {
            return Ok(true);
        }

        self.done_reading(true);
        let Some(keys) = group_by else {
            self.input_eof = true;
            return Ok(false);
        };
        self.ready_in_buf()?;
        if self.input_eof {
            return Ok(false);
        }
        if key_offset(self.byte_at(self.pos)) < keys {
            self.end_input_here();
            return Ok(false);
        }
        Ok(true)
    }

    /// Prepare for the next pump function invocation.
    pub(crate) fn begin_invocation(&mut self) {
        self.first_group_rec = true;
    }

    /// Release the single buffer of a whole-buffer task.
    pub(crate) fn finish_whole_buffer(&mut self) {
        if !self.input_eof {
            self.done_reading(true);
            self.input_eof = true;
        }
    }

    /// Cursor position, used to detect invocations that consumed nothing.
    pub(crate) fn progress(&self) -> (u64, usize, bool) {
        (self.buf_index, self.pos, self.input_eof)
    }

    pub(crate) fn is_input_eof(&self) -> bool {
        self.input_eof
    }

    pub(crate) fn records(&self) -> u64 {
        self.records
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn end_pos(&self) -> BufPos {
        BufPos::new(self.buf_index, self.pos)
    }

    pub(crate) fn take_outputs(&mut self) -> Vec<OutBuf> {
        std::mem::take(&mut self.outs)
    }

    fn cur_len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    fn byte_at(&self, pos: usize) -> u8 {
        self.data
            .as_ref()
            .and_then(|d| d.get(pos).copied())
            .unwrap_or(0)
    }

    fn end_input_here(&mut self) {
        self.done_reading(false);
        self.input_eof = true;
    }

    /// Copy one record body starting at the cursor, following it into later
    /// buffers when it straddles a boundary.
    fn copy_record(&mut self, mode: RecordMode, grouped: bool, rec: &mut Vec<u8>) -> Result<()> {
        let body = match mode {
            RecordMode::Fixed(size) => size - usize::from(grouped),
            _ => 0,
        };
        loop {
            let avail: &[u8] = self.data.as_deref().map_or(&[][..], |d| &d[self.pos..]);
            let (take, complete) = match mode {
                RecordMode::Delimited(delim) => match memchr(delim, avail) {
                    Some(i) => (i + 1, true),
                    None => (avail.len(), false),
                },
                RecordMode::Fixed(_) => {
                    let want = body - rec.len();
                    if avail.len() >= want {
                        (want, true)
                    } else {
                        (avail.len(), false)
                    }
                }
                RecordMode::WholeBuffer => (avail.len(), true),
            };
            rec.extend_from_slice(&avail[..take]);
            self.pos += take;
            if complete {
                return Ok(());
            }

            self.done_reading(true);
            self.ready_in_buf()?;
            if self.input_eof {
                let err = PumpError::PartialRecord { bytes: rec.len() };
                self.shared.raise(err.clone());
                return Err(err);
            }
        }
    }

    /// Count this task as finished with its current buffer, optionally
    /// stepping to the start of the next one.
    fn done_reading(&mut self, move_next: bool) {
        self.data = None;
        {
            let mut state = self.shared.state.lock();
            let buf = state.in_buf_mut(self.buf_index);
            debug_assert!(buf.readers_done < buf.readers);
            buf.readers_done += 1;
            if buf.is_released() {
                self.shared.signals.in_buf_done.notify_one();
            }
        }
        if move_next {
            self.buf_index += 1;
            self.pos = 0;
        }
    }

    /// Wait until the buffer at the cursor is readable, or input ends.
    fn ready_in_buf(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.first_in_buf = false;
        while !state.in_buf_readable(self.buf_index) && state.error.is_none() {
            self.shared.signals.in_buf_readable.wait(&mut state);
        }
        if let Err(err) = state.check() {
            self.input_eof = true;
            return Err(err);
        }
        self.pos = 0;
        if self.buf_index >= state.buf_readable {
            log::trace!("task {}: input eof at buffer {}", self.seq, self.buf_index);
            self.input_eof = true;
            self.data = None;
        } else {
            self.data = Some(Arc::clone(&state.in_buf(self.buf_index).data));
        }
        Ok(())
    }

    fn check_out(&self, out: usize) -> Result<()> {
        if out >= self.outs.len() {
            let err = PumpError::OutputIndex(format!(
                "output index {out} is not less than the number of outputs {}",
                self.outs.len()
            ));
            self.shared.raise(err.clone());
            return Err(err);
        }
        self.shared.check_failed()
    }

    /// Hand a full output buffer to the consumer and wait for it to come back empty.
    fn stall(&mut self, out: usize) -> Result<()> {
        let buf = std::mem::take(&mut self.outs[out]);
        let capacity = buf.capacity();
        let mut state = self.shared.state.lock();
        {
            let slot_out = &mut state.tasks[self.slot].outs[out];
            slot_out.buf = Some(buf);
            slot_out.stalled = true;
        }
        self.shared.signals.output_ready.notify_all();
        self.shared.metrics.record_stall();
        log::trace!("task {} stalled on output {}", self.seq, out);

        while !state.output_emptied(self.slot, out) && state.error.is_none() {
            self.shared.signals.output_empty.wait(&mut state);
        }
        state.check()?;
        self.outs[out] = state.tasks[self.slot].outs[out]
            .buf
            .take()
            .unwrap_or_else(|| OutBuf::new(capacity));
        Ok(())
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("seq", &self.seq)
            .field("worker", &self.worker)
            .field("buf_index", &self.buf_index)
            .field("pos", &self.pos)
            .field("input_eof", &self.input_eof)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_buf_push_stops_at_capacity() {
        let mut buf = OutBuf::new(4);
        assert_eq!(buf.push(b"abc"), 3);
        assert_eq!(buf.push(b"def"), 1);
        assert!(buf.is_full());
        assert_eq!(buf.filled(), b"abcd");
        buf.clear();
        assert_eq!(buf.used(), 0);
        assert_eq!(buf.spare_mut().len(), 4);
    }

    #[test]
    fn test_slot_init_resets_outputs() {
        let mut slot = TaskSlot::new(&[4, 8]);
        if let Some(buf) = slot.outs[0].buf.as_mut() {
            buf.push(b"xy");
        }
        slot.outs[1].stalled = true;
        slot.output_eof = true;
        slot.outs_drained = 2;

        slot.init(7, BufPos::new(3, 5));
        assert_eq!(slot.seq, 7);
        assert_eq!(slot.begin, BufPos::new(3, 5));
        assert_eq!(slot.outs[0].buf.as_ref().map(|b| b.used()), Some(0));
        assert!(!slot.outs[1].stalled);
        assert!(!slot.output_eof);
        assert_eq!(slot.outs_drained, 0);
    }
}
