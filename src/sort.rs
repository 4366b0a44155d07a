//! Sort instances: an external sort engine standing in for the worker pool.
//!
//! Input records are released to the engine as they are written; after input
//! EOF the engine returns sorted records through output 0. The instance moves
//! through [`SortPhase::Input`], [`SortPhase::Output`] and [`SortPhase::Done`]
//! exactly once, or straight to `Done` on error.

use crate::comparator::{self, CompareFn};
use crate::error::{PumpError, Result};
use crate::pipeline::Shared;
use memchr::memchr;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Initial size of the buffer sorted records are returned into.
const STAGING_SIZE: usize = 4096;

/// Key-difference prefixes are single ASCII digits.
const MAX_KEY_DIFF: usize = 9;

/// Lifecycle of a sort instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPhase {
    /// Accepting records
    Input,
    /// Input ended, sorted records are being returned
    Output,
    /// Every record was returned, or the sort failed
    Done,
}

/// Outcome of [`SortEngine::return_records`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortReturn {
    /// This many bytes of whole records were placed in the buffer
    Records(usize),
    /// The next record does not fit; retry with a larger buffer
    BufferTooSmall,
    /// No records are left
    EndOfOutput,
}

/// The narrow release/return protocol a sort engine exposes.
pub trait SortEngine: Send {
    /// Accept a run of input bytes; records may straddle calls.
    fn release_records(&mut self, data: &[u8]) -> Result<()>;

    /// Input is complete.
    fn release_end(&mut self) -> Result<()>;

    /// Fill `buf` with whole sorted records.
    fn return_records(&mut self, buf: &mut [u8]) -> Result<SortReturn>;

    /// Release every resource held by the sort.
    fn end(&mut self);

    /// Human-readable statistics of the completed sort.
    fn stats(&self) -> String;

    /// Whether returned records start with a key-difference prefix byte.
    fn key_diff(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Staging {
    buf: Vec<u8>,
    len: usize,
    offset: usize,
}

/// Drives a [`SortEngine`] on behalf of a sort instance.
pub(crate) struct SortAdapter {
    engine: Mutex<Box<dyn SortEngine>>,
    staging: Mutex<Staging>,
    key_diff: bool,
    final_stats: Mutex<Option<String>>,
}

impl SortAdapter {
    pub(crate) fn new(engine: Box<dyn SortEngine>) -> Self {
        let key_diff = engine.key_diff();
        Self {
            engine: Mutex::new(engine),
            staging: Mutex::new(Staging {
                buf: vec![0; STAGING_SIZE],
                len: 0,
                offset: 0,
            }),
            key_diff,
            final_stats: Mutex::new(None),
        }
    }

    pub(crate) fn key_diff(&self) -> bool {
        self.key_diff
    }

    pub(crate) fn write(&self, shared: &Shared, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            self.close(shared)?;
            return Ok(0);
        }
        shared.check_failed()?;
        if shared.state.lock().sort_phase != SortPhase::Input {
            return Ok(0);
        }
        match self.engine.lock().release_records(data) {
            Ok(()) => {
                shared.metrics.record_bytes_in(data.len());
                Ok(data.len())
            }
            Err(err) => Err(self.post_error(shared, err)),
        }
    }

    pub(crate) fn close(&self, shared: &Shared) -> Result<()> {
        shared.check_failed()?;
        if shared.state.lock().sort_phase != SortPhase::Input {
            log::debug!("ignoring redundant sort input eof");
            return Ok(());
        }
        if let Err(err) = self.engine.lock().release_end() {
            return Err(self.post_error(shared, err));
        }
        self.set_phase(shared, SortPhase::Output);
        Ok(())
    }

    pub(crate) fn abort(&self, shared: &Shared, msg: String) {
        self.engine.lock().end();
        let mut state = shared.state.lock();
        shared.raise_locked(&mut state, PumpError::Upstream(msg));
        state.sort_phase = SortPhase::Done;
        shared.signals.output_ready.notify_all();
    }

    pub(crate) fn read(&self, shared: &Shared, dst: &mut [u8]) -> Result<usize> {
        {
            let mut state = shared.state.lock();
            while state.error.is_none() && state.sort_phase == SortPhase::Input {
                shared.signals.output_ready.wait(&mut state);
            }
            state.check()?;
            if state.sort_phase == SortPhase::Done {
                return Ok(0);
            }
        }

        let mut guard = self.staging.lock();
        let staging = &mut *guard;
        let mut returned = 0;
        while returned < dst.len() {
            if staging.offset == staging.len {
                match self.refill(staging) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.finish(shared);
                        break;
                    }
                    Err(err) => return Err(self.post_error(shared, err)),
                }
            }
            let src = &staging.buf[staging.offset..staging.len];
            let n = src.len().min(dst.len() - returned);
            dst[returned..returned + n].copy_from_slice(&src[..n]);
            returned += n;
            staging.offset += n;
        }
        shared.metrics.record_bytes_out(returned);
        Ok(returned)
    }

    pub(crate) fn wait(&self, shared: &Shared) -> Result<()> {
        let mut state = shared.state.lock();
        while state.error.is_none() && state.sort_phase != SortPhase::Done {
            shared.signals.output_ready.wait(&mut state);
        }
        state.check()
    }

    pub(crate) fn stats(&self, shared: &Shared) -> String {
        if shared.error().is_some() {
            return "no stats because of sort error".to_string();
        }
        if let Some(stats) = self.final_stats.lock().as_ref() {
            return stats.clone();
        }
        self.engine.lock().stats()
    }

    /// Ask the engine for the next run of records, growing the staging buffer
    /// until at least one record fits. `Ok(false)` at end of output.
    fn refill(&self, staging: &mut Staging) -> Result<bool> {
        let mut engine = self.engine.lock();
        loop {
            match engine.return_records(&mut staging.buf)? {
                SortReturn::Records(n) if n > 0 => {
                    staging.len = n.min(staging.buf.len());
                    staging.offset = 0;
                    return Ok(true);
                }
                SortReturn::BufferTooSmall => {
                    let size = staging.buf.len() * 2;
                    log::debug!("sort staging buffer grown to {size} bytes");
                    staging.buf.resize(size, 0);
                }
                SortReturn::Records(_) | SortReturn::EndOfOutput => return Ok(false),
            }
        }
    }

    fn finish(&self, shared: &Shared) {
        {
            let mut engine = self.engine.lock();
            *self.final_stats.lock() = Some(engine.stats());
            engine.end();
        }
        self.set_phase(shared, SortPhase::Done);
    }

    fn set_phase(&self, shared: &Shared, phase: SortPhase) {
        let mut state = shared.state.lock();
        if state.sort_phase == phase || state.sort_phase == SortPhase::Done {
            return;
        }
        state.sort_phase = phase;
        shared.signals.output_ready.notify_all();
        log::debug!("sort phase is now {phase:?}");
    }

    fn post_error(&self, shared: &Shared, err: PumpError) -> PumpError {
        let mut state = shared.state.lock();
        shared.raise_locked(&mut state, err.clone());
        state.sort_phase = SortPhase::Done;
        shared.signals.output_ready.notify_all();
        err
    }
}

/// How the in-memory sort carves its input into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Delimited(u8),
    Fixed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    /// 1-based field number
    Field(usize),
    /// Byte range of the record
    Span { offset: usize, len: usize },
}

#[derive(Clone)]
struct KeySpec {
    source: KeySource,
    compare: CompareFn,
}

/// A reference [`SortEngine`] that sorts everything in memory.
///
/// The definition string is a whitespace-separated list of directives:
///
/// | directive | meaning |
/// |-----------|---------|
/// | `DELIM=<c>` | records end with byte `c` (default newline) |
/// | `REC_SIZE=<n>` | records are `n` bytes each |
/// | `FIELD_SEP=<c>` | field separator for field keys (default tab) |
/// | `KEY=<field>[:<cmp>]` | key on a 1-based field |
/// | `KEY=<offset>+<len>[:<cmp>]` | key on a byte range |
/// | `MATCH[=<n>]` | prefix each record with the count of leading keys equal to the previous record's, capped at `n` |
/// | `THREADS=<n>` | accepted and ignored |
///
/// `<cmp>` names a comparator in the [`comparator`] registry; the default is
/// `bytes`. Without a `KEY` the whole record (sans delimiter) is the key.
/// Records that compare equal keep their input order.
pub struct MemorySort {
    layout: Layout,
    field_sep: u8,
    keys: Vec<KeySpec>,
    match_keys: Option<usize>,
    pending: Vec<u8>,
    records: Vec<Vec<u8>>,
    prefixes: Vec<u8>,
    next: usize,
    sorted: bool,
    bytes_in: u64,
    sort_time: Duration,
}

impl MemorySort {
    /// Parse a sort definition.
    pub fn define(def: &str) -> Result<MemorySort> {
        let mut layout = Layout::Delimited(b'\n');
        let mut field_sep = b'\t';
        let mut keys = Vec::new();
        let mut match_keys = None;

        for token in def.split_whitespace() {
            let body = token.strip_prefix('-').unwrap_or(token);
            let (keyword, value) = match body.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (body, None),
            };
            match keyword.to_ascii_uppercase().as_str() {
                "DELIM" | "DELIMITER" => {
                    layout = Layout::Delimited(parse_byte(token, value)?);
                }
                "REC_SIZE" => {
                    let size = parse_number(token, value)?;
                    if size == 0 {
                        return Err(def_error(token, "record size must be positive"));
                    }
                    layout = Layout::Fixed(size);
                }
                "FIELD_SEP" => field_sep = parse_byte(token, value)?,
                "KEY" => keys.push(parse_key(token, value)?),
                "MATCH" | "DIFF" => {
                    let cap = match value {
                        Some(_) => parse_number(token, value)?,
                        None => MAX_KEY_DIFF,
                    };
                    match_keys = Some(cap.min(MAX_KEY_DIFF));
                }
                "THREADS" | "PROCESS" => {
                    parse_number(token, value)?;
                }
                "STAT" => {}
                _ => return Err(def_error(token, "unrecognized directive")),
            }
        }

        if keys.is_empty() {
            keys.push(KeySpec {
                source: KeySource::Span {
                    offset: 0,
                    len: usize::MAX,
                },
                compare: resolve_comparator(def, "bytes")?,
            });
        }
        log::debug!(
            "sort defined: {:?}, {} keys, key diff {:?}",
            layout,
            keys.len(),
            match_keys
        );
        Ok(MemorySort {
            layout,
            field_sep,
            keys,
            match_keys,
            pending: Vec::new(),
            records: Vec::new(),
            prefixes: Vec::new(),
            next: 0,
            sorted: false,
            bytes_in: 0,
            sort_time: Duration::ZERO,
        })
    }

    /// Key bytes of `rec` for `key`; missing fields and ranges are empty.
    fn key_bytes<'r>(&self, rec: &'r [u8], key: &KeySpec) -> &'r [u8] {
        let body = match self.layout {
            Layout::Delimited(delim) => rec.strip_suffix(&[delim]).unwrap_or(rec),
            Layout::Fixed(_) => rec,
        };
        match key.source {
            KeySource::Field(n) => body
                .split(|&b| b == self.field_sep)
                .nth(n - 1)
                .unwrap_or(&[]),
            KeySource::Span { offset, len } => {
                let start = offset.min(body.len());
                let end = offset.saturating_add(len).min(body.len());
                &body[start..end]
            }
        }
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        for key in &self.keys {
            let ord = (key.compare)(self.key_bytes(a, key), self.key_bytes(b, key));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Number of leading keys `a` and `b` share.
    fn equal_keys(&self, a: &[u8], b: &[u8]) -> usize {
        self.keys
            .iter()
            .take_while(|key| (key.compare)(self.key_bytes(a, key), self.key_bytes(b, key)) == Ordering::Equal)
            .count()
    }

    fn split_records(&mut self) {
        let mut start = 0;
        match self.layout {
            Layout::Delimited(delim) => {
                while let Some(i) = memchr(delim, &self.pending[start..]) {
                    self.records.push(self.pending[start..start + i + 1].to_vec());
                    start += i + 1;
                }
            }
            Layout::Fixed(size) => {
                while self.pending.len() - start >= size {
                    self.records.push(self.pending[start..start + size].to_vec());
                    start += size;
                }
            }
        }
        self.pending.drain(..start);
    }
}

impl SortEngine for MemorySort {
    fn release_records(&mut self, data: &[u8]) -> Result<()> {
        if self.sorted {
            return Err(PumpError::SortExecution(
                "records released after end of input".into(),
            ));
        }
        self.bytes_in += data.len() as u64;
        self.pending.extend_from_slice(data);
        self.split_records();
        Ok(())
    }

    fn release_end(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            match self.layout {
                Layout::Delimited(delim) => {
                    let mut rec = std::mem::take(&mut self.pending);
                    rec.push(delim);
                    self.records.push(rec);
                }
                Layout::Fixed(size) => {
                    return Err(PumpError::SortExecution(format!(
                        "{} trailing bytes do not make a {size}-byte record",
                        self.pending.len()
                    )));
                }
            }
        }

        let started = Instant::now();
        let mut records = std::mem::take(&mut self.records);
        records.sort_by(|a, b| self.compare(a, b));
        if let Some(cap) = self.match_keys {
            let mut prefixes = Vec::with_capacity(records.len());
            for (i, rec) in records.iter().enumerate() {
                let shared = match i {
                    0 => 0,
                    _ => self.equal_keys(&records[i - 1], rec).min(cap),
                };
                prefixes.push(b'0' + shared as u8);
            }
            self.prefixes = prefixes;
        }
        self.records = records;
        self.sort_time = started.elapsed();
        self.sorted = true;
        log::debug!(
            "sorted {} records in {:?}",
            self.records.len(),
            self.sort_time
        );
        Ok(())
    }

    fn return_records(&mut self, buf: &mut [u8]) -> Result<SortReturn> {
        if !self.sorted {
            return Err(PumpError::SortExecution(
                "records requested before end of input".into(),
            ));
        }
        let prefix = usize::from(self.match_keys.is_some());
        let mut n = 0;
        while let Some(rec) = self.records.get(self.next) {
            if n + prefix + rec.len() > buf.len() {
                break;
            }
            if prefix == 1 {
                buf[n] = self.prefixes[self.next];
            }
            n += prefix;
            buf[n..n + rec.len()].copy_from_slice(rec);
            n += rec.len();
            self.next += 1;
        }
        Ok(match n {
            0 if self.next == self.records.len() => SortReturn::EndOfOutput,
            0 => SortReturn::BufferTooSmall,
            n => SortReturn::Records(n),
        })
    }

    fn end(&mut self) {
        self.pending = Vec::new();
        self.records = Vec::new();
        self.prefixes = Vec::new();
    }

    fn stats(&self) -> String {
        format!(
            "records: {}, bytes: {}, keys: {}, sort time: {:.3}s",
            self.records.len(),
            self.bytes_in,
            self.keys.len(),
            self.sort_time.as_secs_f64()
        )
    }

    fn key_diff(&self) -> bool {
        self.match_keys.is_some()
    }
}

fn def_error(token: &str, what: &str) -> PumpError {
    PumpError::SortDefinition(format!("{what} at \"{token}\""))
}

fn parse_number(token: &str, value: Option<&str>) -> Result<usize> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| def_error(token, "expected a number"))
}

/// A single byte, or one of the escapes `\t`, `\n`, `\0`.
fn parse_byte(token: &str, value: Option<&str>) -> Result<u8> {
    match value.map(str::as_bytes) {
        Some([b]) => Ok(*b),
        Some(b"\\t") => Ok(b'\t'),
        Some(b"\\n") => Ok(b'\n'),
        Some(b"\\0") => Ok(0),
        _ => Err(def_error(token, "expected a single character")),
    }
}

fn parse_key(token: &str, value: Option<&str>) -> Result<KeySpec> {
    let value = value.ok_or_else(|| def_error(token, "expected a key position"))?;
    let (position, cmp) = match value.split_once(':') {
        Some((p, c)) => (p, c),
        None => (value, "bytes"),
    };
    let number = |text: &str| -> Result<usize> {
        text.parse()
            .map_err(|_| def_error(token, "expected a numeric key position"))
    };
    let source = match position.split_once('+') {
        Some((offset, len)) => KeySource::Span {
            offset: number(offset)?,
            len: number(len)?,
        },
        None => match number(position)? {
            0 => return Err(def_error(token, "fields are numbered from 1")),
            n => KeySource::Field(n),
        },
    };
    Ok(KeySpec {
        source,
        compare: resolve_comparator(token, cmp)?,
    })
}

fn resolve_comparator(token: &str, name: &str) -> Result<CompareFn> {
    comparator::resolve(name)
        .ok_or_else(|| def_error(token, &format!("unknown comparator \"{name}\"")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort_all(sort: &mut MemorySort, input: &[u8]) -> Vec<u8> {
        sort.release_records(input).unwrap();
        sort.release_end().unwrap();
        let mut out = Vec::new();
        let mut buf = vec![0u8; 16];
        loop {
            match sort.return_records(&mut buf).unwrap() {
                SortReturn::Records(n) => out.extend_from_slice(&buf[..n]),
                SortReturn::BufferTooSmall => buf.resize(buf.len() * 2, 0),
                SortReturn::EndOfOutput => break,
            }
        }
        out
    }

    #[test]
    fn test_whole_record_sort() {
        let mut sort = MemorySort::define("").unwrap();
        assert_eq!(sort_all(&mut sort, b"pear\napple\nfig\n"), b"apple\nfig\npear\n");
    }

    #[test]
    fn test_missing_final_delimiter_is_supplied() {
        let mut sort = MemorySort::define("").unwrap();
        assert_eq!(sort_all(&mut sort, b"b\na"), b"a\nb\n");
    }

    #[test]
    fn test_field_key_is_stable() {
        let mut sort = MemorySort::define("FIELD_SEP=, KEY=2").unwrap();
        let out = sort_all(&mut sort, b"x,2\ny,1\nz,2\nw,1\n");
        assert_eq!(out, b"y,1\nw,1\nx,2\nz,2\n");
    }

    #[test]
    fn test_key_diff_prefixes() {
        let mut sort = MemorySort::define("KEY=1 KEY=2 MATCH").unwrap();
        assert!(sort.key_diff());
        let out = sort_all(&mut sort, b"b\t1\na\t2\na\t1\na\t1\n");
        assert_eq!(out, b"0a\t1\n2a\t1\n1a\t2\n0b\t1\n");
    }

    #[test]
    fn test_match_cap() {
        let mut sort = MemorySort::define("KEY=1 KEY=2 MATCH=1").unwrap();
        let out = sort_all(&mut sort, b"a\t1\na\t1\n");
        assert_eq!(out, b"0a\t1\n1a\t1\n");
    }

    #[test]
    fn test_fixed_records_by_span() {
        let mut sort = MemorySort::define("REC_SIZE=4 KEY=2+2").unwrap();
        let out = sort_all(&mut sort, b"aa09bb01cc05");
        assert_eq!(out, b"bb01cc05aa09");
    }

    #[test]
    fn test_fixed_remainder_is_an_error() {
        let mut sort = MemorySort::define("REC_SIZE=4").unwrap();
        sort.release_records(b"abcdef").unwrap();
        let err = sort.release_end().unwrap_err();
        assert!(matches!(err, PumpError::SortExecution(_)));
    }

    #[test]
    fn test_record_larger_than_buffer() {
        let mut sort = MemorySort::define("").unwrap();
        sort.release_records(b"a-long-record\n").unwrap();
        sort.release_end().unwrap();
        let mut small = [0u8; 4];
        assert_eq!(sort.return_records(&mut small).unwrap(), SortReturn::BufferTooSmall);
        let mut big = [0u8; 32];
        assert_eq!(sort.return_records(&mut big).unwrap(), SortReturn::Records(14));
        assert_eq!(sort.return_records(&mut big).unwrap(), SortReturn::EndOfOutput);
    }

    #[test]
    fn test_bad_definitions() {
        for def in ["KEY=0", "KEY=x", "FROB", "REC_SIZE=0", "KEY=1:nosuch", "DELIM=ab"] {
            let err = MemorySort::define(def).err();
            assert!(
                matches!(err, Some(PumpError::SortDefinition(_))),
                "{def} should be rejected"
            );
        }
    }

    #[test]
    fn test_numeric_comparator() {
        let mut sort = MemorySort::define("KEY=1:numeric").unwrap();
        assert_eq!(sort_all(&mut sort, b"10\n9\n100\n"), b"9\n10\n100\n");
    }
}
