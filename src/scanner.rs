//! Record boundary detection for freshly filled input buffers.
//!
//! When the producer flushes a buffer the scanner answers two questions:
//!
//! - does the task issued before this buffer still have bytes to read here
//!   (a record remainder, or the rest of its key group)?
//! - where in this buffer, if anywhere, may the next task begin?
//!
//! Task boundaries always fall on record starts. In grouped mode they only
//! fall on records whose key-difference prefix is below the group-by count,
//! so a key group never straddles two tasks.

use crate::config::RecordMode;
use memchr::{memchr, memrchr};

/// Decode a key-difference prefix byte: the number of leading keys shared
/// with the previous record.
pub(crate) fn key_offset(prefix: u8) -> usize {
    prefix.wrapping_sub(b'0') as usize
}

/// Outcome of scanning one flushed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Boundary {
    /// The previously issued task must also read this buffer
    pub(crate) carried_reader: bool,
    /// Offset of the first byte of a new task's input
    pub(crate) task_start: Option<usize>,
}

/// Producer-side scanner state carried from one buffer to the next.
#[derive(Debug)]
pub(crate) struct Scanner {
    mode: RecordMode,
    group_by: Option<usize>,
    partial: usize,
    scanned: u64,
}

impl Scanner {
    pub(crate) fn new(mode: RecordMode, group_by: Option<usize>) -> Self {
        Self {
            mode,
            group_by,
            partial: 0,
            scanned: 0,
        }
    }

    /// Bytes of an unfinished record at the end of everything scanned so far
    pub(crate) fn partial(&self) -> usize {
        self.partial
    }

    /// Scan the next buffer in input order.
    pub(crate) fn scan(&mut self, buf: &[u8]) -> Boundary {
        let first = self.scanned == 0;
        self.scanned += 1;

        let (carried_reader, start) = match self.mode {
            RecordMode::WholeBuffer => (false, 0),
            _ if first => (false, 0),
            _ => match self.group_by {
                Some(keys) => (true, self.group_start(buf, keys)),
                None if self.partial != 0 => (true, self.after_partial(buf)),
                None => (false, 0),
            },
        };

        self.partial = match self.mode {
            RecordMode::Delimited(delim) => match memrchr(delim, buf) {
                Some(last) => buf.len() - 1 - last,
                None => self.partial + buf.len(),
            },
            RecordMode::Fixed(size) => (self.partial + buf.len()) % size,
            RecordMode::WholeBuffer => 0,
        };

        Boundary {
            carried_reader,
            task_start: (start < buf.len()).then_some(start),
        }
    }

    /// Offset of the first record starting in `buf`, skipping the remainder
    /// of a record begun in an earlier buffer.
    fn after_partial(&self, buf: &[u8]) -> usize {
        if self.partial == 0 {
            return 0;
        }
        match self.mode {
            RecordMode::Delimited(delim) => memchr(delim, buf).map_or(buf.len(), |i| i + 1),
            RecordMode::Fixed(size) => (size - self.partial).min(buf.len()),
            RecordMode::WholeBuffer => 0,
        }
    }

    /// Offset of the first record in `buf` that opens a new key group.
    fn group_start(&self, buf: &[u8], keys: usize) -> usize {
        let mut pos = self.after_partial(buf);
        match self.mode {
            RecordMode::Delimited(delim) => {
                while pos < buf.len() {
                    if key_offset(buf[pos]) < keys {
                        return pos;
                    }
                    pos = match memchr(delim, &buf[pos..]) {
                        Some(i) => pos + i + 1,
                        None => buf.len(),
                    };
                }
                buf.len()
            }
            RecordMode::Fixed(size) => {
                while pos < buf.len() {
                    if key_offset(buf[pos]) < keys {
                        return pos;
                    }
                    pos += size;
                }
                buf.len()
            }
            RecordMode::WholeBuffer => 0,
        }
    }
}
