//! Output drain protocol: serve each output's bytes in strict task order.
//!
//! A consumer of output `i` always works on the oldest task not yet drained
//! for `i`. It waits until that task either finished (`output_eof`) or
//! stalled on a full buffer, then takes the buffer out of the slot and copies
//! from it without holding the state lock. A fully copied buffer goes back to
//! the slot: emptied and handed back to a stalled worker, or counted as
//! drained. Once a task is drained on every output its slot may be reused.

use crate::error::Result;
use crate::pipeline::Shared;
use crate::task::OutBuf;

/// Consumer-side state of one output
#[derive(Debug, Default)]
pub(crate) struct Drain {
    /// Buffer of the oldest undrained task, taken from its slot
    held: Option<OutBuf>,
    /// Bytes of `held` already handed out
    offset: usize,
}

impl Shared {
    /// Copy up to `dst.len()` bytes of output `out`. Returns 0 only at end of output.
    pub(crate) fn drain_output(&self, out: usize, dst: &mut [u8]) -> Result<usize> {
        let mut guard = self.drains[out].lock();
        let drain = &mut *guard;
        let mut returned = 0;

        loop {
            if drain.held.is_none() {
                let mut state = self.state.lock();
                if returned > 0 && !state.output_has_data(out) {
                    break;
                }
                while state.error.is_none()
                    && !state.output_at_eof(out)
                    && !state.output_has_data(out)
                {
                    self.signals.output_ready.wait(&mut state);
                }
                state.check()?;
                if !state.output_has_data(out) {
                    log::trace!("output {out}: eof");
                    break;
                }
                let seq = state.out_drained[out];
                let slot = state.slot_of(seq);
                drain.held = Some(state.tasks[slot].outs[out].buf.take().unwrap_or_default());
                drain.offset = 0;
            }

            let Some(held) = drain.held.as_ref() else {
                break;
            };
            let src = &held.filled()[drain.offset..];
            let n = src.len().min(dst.len() - returned);
            dst[returned..returned + n].copy_from_slice(&src[..n]);
            returned += n;
            drain.offset += n;
            if drain.offset < held.used() {
                // caller's buffer is full, the rest waits for the next call
                break;
            }

            self.release_drained(out, drain);
            if returned == dst.len() {
                break;
            }
        }

        self.metrics.record_bytes_out(returned);
        Ok(returned)
    }

    /// Hand a fully copied buffer back to its task slot.
    fn release_drained(&self, out: usize, drain: &mut Drain) {
        let Some(mut buf) = drain.held.take() else {
            return;
        };
        drain.offset = 0;

        let mut state = self.state.lock();
        let seq = state.out_drained[out];
        let slot = state.slot_of(seq);
        let outputs = state.out_drained.len();
        let task_out = &mut state.tasks[slot].outs[out];
        if task_out.stalled {
            buf.clear();
            task_out.buf = Some(buf);
            task_out.stalled = false;
            self.signals.output_empty.notify_all();
            log::trace!("output {out}: emptied buffer of stalled task {seq}");
            return;
        }

        task_out.buf = Some(buf);
        state.out_drained[out] += 1;
        let task_slot = &mut state.tasks[slot];
        task_slot.outs_drained += 1;
        if task_slot.outs_drained == outputs {
            let worker = task_slot.worker;
            state.task_drained += 1;
            self.signals.task_drained.notify_one();
            log::trace!("task {seq} of worker {worker} drained on all outputs");
        }
    }
}
