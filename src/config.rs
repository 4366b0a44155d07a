//! Pump configuration: typed builder setters plus the textual directive syntax.
//!
//! Both routes end in [`PumpBuilder::config`], which validates everything before
//! a single buffer is allocated or thread spawned.

use crate::error::{PumpError, Result};

/// Default input buffer size (256 KiB).
pub const DEFAULT_IN_BUF_SIZE: usize = 1 << 18;

/// Default record delimiter.
pub const DEFAULT_DELIMITER: u8 = b'\n';

/// How the input byte stream is carved into records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// Records end at (and include) a single delimiter byte
    Delimited(u8),
    /// Records are exactly this many bytes
    Fixed(usize),
    /// No records: each input buffer is one task's input
    WholeBuffer,
}

impl RecordMode {
    /// Whether the mode has record boundaries at all.
    pub fn has_records(&self) -> bool {
        !matches!(self, RecordMode::WholeBuffer)
    }
}

/// Size of each task's staging buffer for one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutBufSize {
    /// Absolute size in bytes
    Bytes(usize),
    /// Multiple of the input buffer size
    Multiple(usize),
}

/// Configuration of one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Capacity of each task's staging buffer for this output
    pub buf_size: usize,
    /// File (or `<stdout>`/`<stderr>`) that a sink thread drains this output into
    pub file: Option<String>,
}

/// Validated configuration for a pump instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    /// Worker threads executing the pump function
    pub threads: usize,
    /// Task slots in the task ring
    pub tasks: usize,
    /// Buffers in the input ring
    pub in_buffers: usize,
    /// Capacity of each input buffer
    pub in_buf_size: usize,
    /// Record carving mode
    pub record_mode: RecordMode,
    /// Number of leading keys that define a reduce group, if grouping
    pub group_by: Option<usize>,
    /// Output streams
    pub outputs: Vec<OutputConfig>,
    /// File (or `<stdin>`) that a source thread feeds into the pump
    pub in_file: Option<String>,
}

impl PumpConfig {
    /// Number of outputs.
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Whether records carry a key-difference prefix byte.
    pub fn is_grouped(&self) -> bool {
        self.group_by.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Delimited,
    Fixed,
    Whole,
}

/// Builder for pump configuration
#[derive(Debug, Clone, Default)]
pub struct PumpBuilder {
    threads: Option<usize>,
    tasks: Option<usize>,
    in_buffers: Option<usize>,
    in_buf_size: Option<usize>,
    outputs: Option<usize>,
    out_buf_sizes: Vec<(usize, OutBufSize)>,
    out_files: Vec<(usize, String)>,
    record_kinds: Vec<RecordKind>,
    delimiter: Option<u8>,
    rec_size: Option<usize>,
    group_by: Option<usize>,
    in_file: Option<String>,
}

impl PumpBuilder {
    /// Create a builder with every setting at its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Set the number of task slots
    pub fn tasks(mut self, tasks: usize) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Set the number of input buffers
    pub fn in_buffers(mut self, in_buffers: usize) -> Self {
        self.in_buffers = Some(in_buffers);
        self
    }

    /// Set the capacity of each input buffer
    pub fn in_buf_size(mut self, size: usize) -> Self {
        self.in_buf_size = Some(size);
        self
    }

    /// Set the number of output streams
    pub fn outputs(mut self, outputs: usize) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Set the per-task staging buffer size of one output
    pub fn out_buf_size(mut self, index: usize, size: OutBufSize) -> Self {
        self.out_buf_sizes.push((index, size));
        self
    }

    /// Records are delimited by `delimiter`
    pub fn delimited(mut self, delimiter: u8) -> Self {
        self.record_kinds.push(RecordKind::Delimited);
        self.delimiter = Some(delimiter);
        self
    }

    /// Records are `size` bytes each
    pub fn fixed(mut self, size: usize) -> Self {
        self.record_kinds.push(RecordKind::Fixed);
        self.rec_size = Some(size);
        self
    }

    /// Each input buffer is one task
    pub fn whole_buffer(mut self) -> Self {
        self.record_kinds.push(RecordKind::Whole);
        self
    }

    /// Set the record mode in one call
    pub fn record_mode(self, mode: RecordMode) -> Self {
        match mode {
            RecordMode::Delimited(d) => self.delimited(d),
            RecordMode::Fixed(n) => self.fixed(n),
            RecordMode::WholeBuffer => self.whole_buffer(),
        }
    }

    /// Group records by their first `keys` keys so no group spans two tasks
    pub fn group_by(mut self, keys: usize) -> Self {
        self.group_by = Some(keys);
        self
    }

    /// Feed the pump from a file (or `<stdin>`)
    pub fn in_file(mut self, path: impl Into<String>) -> Self {
        self.in_file = Some(path.into());
        self
    }

    /// Drain an output into a file (or `<stdout>`/`<stderr>`)
    pub fn out_file(mut self, index: usize, path: impl Into<String>) -> Self {
        self.out_files.push((index, path.into()));
        self
    }

    /// Apply a whitespace-separated directive string such as
    /// `"THREADS=4 IN_BUF_SIZE=64k OUT_BUF_SIZE[1]=2x GROUP_BY=1"`.
    pub fn directives(mut self, text: &str) -> Result<Self> {
        for token in text.split_whitespace() {
            self = self.apply_directive(token)?;
        }
        Ok(self)
    }

    fn apply_directive(mut self, token: &str) -> Result<Self> {
        let body = token.strip_prefix('-').unwrap_or(token);
        if body.is_empty() {
            return Ok(self);
        }
        let (keyword, rest) = split_keyword(body);
        let upper = keyword.to_ascii_uppercase();

        match upper.as_str() {
            "ASCII" | "UTF_8" | "UTF8" => {
                no_value(token, rest)?;
                self.record_kinds.push(RecordKind::Delimited);
            }
            "DELIM" | "DELIMITER" => {
                let value = expect_value(token, rest)?;
                let bytes = value.as_bytes();
                if bytes.len() != 1 {
                    return Err(PumpError::Config(format!(
                        "only single-byte delimiters are allowed, got {value:?}"
                    )));
                }
                self.record_kinds.push(RecordKind::Delimited);
                self.delimiter = Some(bytes[0]);
            }
            "REC_SIZE" => {
                let value = expect_value(token, rest)?;
                self.record_kinds.push(RecordKind::Fixed);
                self.rec_size = Some(parse_count(token, value)?);
            }
            "WHOLE" | "WHOLE_BUF" => {
                no_value(token, rest)?;
                self.record_kinds.push(RecordKind::Whole);
            }
            "GROUP_BY" | "GROUP" | "REDUCE_BY_KEYS" => {
                let keys = match rest {
                    "" => 1,
                    _ => parse_count(token, expect_value(token, rest)?)?,
                };
                self.group_by = Some(keys);
            }
            "THREADS" => {
                let n = parse_count(token, expect_value(token, rest)?)?;
                // a non-positive thread count keeps the default
                if n > 0 {
                    self.threads = Some(n);
                }
            }
            "TASKS" => {
                let n = parse_count(token, expect_value(token, rest)?)?;
                self.tasks = Some(n);
                self.in_buffers = Some(n);
            }
            "IN_BUFS" => {
                self.in_buffers = Some(parse_count(token, expect_value(token, rest)?)?);
            }
            "IN_BUF_SIZE" => {
                self.in_buf_size = Some(parse_size(expect_value(token, rest)?)?);
            }
            "OUTPUTS" => {
                self.outputs = Some(parse_count(token, expect_value(token, rest)?)?);
            }
            "OUT_BUF_SIZE" => {
                let (index, value) = indexed_value(token, rest)?;
                self.out_buf_sizes.push((index, parse_out_size(value)?));
            }
            "IN" | "IN_FILE" => {
                self.in_file = Some(expect_value(token, rest)?.to_string());
            }
            "OUT" | "OUT_FILE" => {
                let (index, value) = indexed_value(token, rest)?;
                self.out_files.push((index, value.to_string()));
            }
            _ => {
                return Err(PumpError::Syntax(format!("unrecognized keyword at \"{token}\"")));
            }
        }
        Ok(self)
    }

    /// Validate the settings and produce the final configuration
    pub fn config(&self) -> Result<PumpConfig> {
        let mut kinds = self.record_kinds.clone();
        kinds.sort_by_key(|k| *k as u8);
        kinds.dedup();
        if kinds.len() > 1 {
            return Err(PumpError::Config("multiple record types specified".into()));
        }
        let record_mode = match kinds.first() {
            None | Some(RecordKind::Delimited) => {
                RecordMode::Delimited(self.delimiter.unwrap_or(DEFAULT_DELIMITER))
            }
            Some(RecordKind::Fixed) => match self.rec_size {
                Some(n) if n > 0 => RecordMode::Fixed(n),
                _ => {
                    return Err(PumpError::Config(
                        "fixed-size records must have a declared size".into(),
                    ))
                }
            },
            Some(RecordKind::Whole) => RecordMode::WholeBuffer,
        };

        if let Some(keys) = self.group_by {
            if !record_mode.has_records() {
                return Err(PumpError::Config(
                    "grouping by keys requires records, not whole buffers".into(),
                ));
            }
            if keys == 0 {
                return Err(PumpError::Config("group-by key count must be at least 1".into()));
            }
            if let RecordMode::Fixed(1) = record_mode {
                return Err(PumpError::Config(
                    "grouped fixed-size records must be larger than their prefix byte".into(),
                ));
            }
        }

        let threads = match self.threads {
            Some(0) => return Err(PumpError::Config("thread count must be positive".into())),
            Some(n) => n,
            None => default_threads(),
        };
        let tasks = self.tasks.unwrap_or(3 * threads);
        let in_buffers = self.in_buffers.unwrap_or(3 * threads);
        let in_buf_size = self.in_buf_size.unwrap_or(DEFAULT_IN_BUF_SIZE);
        let num_outputs = self.outputs.unwrap_or(1);
        for (name, value) in [
            ("task count", tasks),
            ("input buffer count", in_buffers),
            ("input buffer size", in_buf_size),
            ("output count", num_outputs),
        ] {
            if value == 0 {
                return Err(PumpError::Config(format!("{name} must be positive")));
            }
        }

        let mut outputs = vec![
            OutputConfig {
                buf_size: 2 * in_buf_size,
                file: None,
            };
            num_outputs
        ];
        for &(index, size) in &self.out_buf_sizes {
            let out = outputs.get_mut(index).ok_or_else(|| {
                PumpError::Config(format!(
                    "output index {index} is not less than the number of outputs {num_outputs}"
                ))
            })?;
            out.buf_size = match size {
                OutBufSize::Bytes(n) => n,
                OutBufSize::Multiple(m) => m * in_buf_size,
            };
            if out.buf_size == 0 {
                return Err(PumpError::Config(format!("output {index} buffer size must be positive")));
            }
        }
        for (index, path) in &self.out_files {
            let out = outputs.get_mut(*index).ok_or_else(|| {
                PumpError::Config(format!(
                    "output index {index} is not less than the number of outputs {num_outputs}"
                ))
            })?;
            out.file = Some(path.clone());
        }

        Ok(PumpConfig {
            threads,
            tasks,
            in_buffers,
            in_buf_size,
            record_mode,
            group_by: self.group_by,
            outputs,
            in_file: self.in_file.clone(),
        })
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Split `KEYWORD=value` / `KEYWORD[1]=value` into the keyword and the rest.
fn split_keyword(body: &str) -> (&str, &str) {
    match body.find(|c| c == '=' || c == '[') {
        Some(pos) => (&body[..pos], &body[pos..]),
        None => (body, ""),
    }
}

fn no_value(token: &str, rest: &str) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(PumpError::Syntax(format!("unexpected value at \"{token}\"")))
    }
}

fn expect_value<'a>(token: &str, rest: &'a str) -> Result<&'a str> {
    match rest.strip_prefix('=') {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(PumpError::Syntax(format!("expected '=' and a value at \"{token}\""))),
    }
}

/// Parse an optional `[index]` followed by `=value`; a missing index means output 0.
fn indexed_value<'a>(token: &str, rest: &'a str) -> Result<(usize, &'a str)> {
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .ok_or_else(|| PumpError::Syntax(format!("expected ']' at \"{token}\"")))?;
        let index = parse_count(token, &after[..close])?;
        let value = expect_value(token, &after[close + 1..])?;
        Ok((index, value))
    } else {
        Ok((0, expect_value(token, rest)?))
    }
}

fn parse_count(token: &str, text: &str) -> Result<usize> {
    text.parse::<usize>()
        .map_err(|_| PumpError::Syntax(format!("expected numeric argument at \"{token}\"")))
}

/// Parse a byte size with an optional `k`, `m` or `g` suffix (powers of 1024).
pub fn parse_size(text: &str) -> Result<usize> {
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(digits_end);
    let value: usize = digits
        .parse()
        .map_err(|_| PumpError::Syntax(format!("expected numeric argument at \"{text}\"")))?;
    let scale = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        _ => return Err(PumpError::Syntax(format!("unrecognized size suffix at \"{text}\""))),
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| PumpError::Syntax(format!("size overflows at \"{text}\"")))
}

fn parse_out_size(text: &str) -> Result<OutBufSize> {
    match text.strip_suffix(['x', 'X']) {
        Some(mult) => {
            let m = mult
                .parse()
                .map_err(|_| PumpError::Syntax(format!("expected numeric argument at \"{text}\"")))?;
            Ok(OutBufSize::Multiple(m))
        }
        None => Ok(OutBufSize::Bytes(parse_size(text)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = PumpBuilder::new().threads(2).config().unwrap();
        assert_eq!(cfg.tasks, 6);
        assert_eq!(cfg.in_buffers, 6);
        assert_eq!(cfg.in_buf_size, DEFAULT_IN_BUF_SIZE);
        assert_eq!(cfg.record_mode, RecordMode::Delimited(b'\n'));
        assert_eq!(cfg.outputs.len(), 1);
        assert_eq!(cfg.outputs[0].buf_size, 2 * DEFAULT_IN_BUF_SIZE);
    }

    #[test]
    fn test_directives() {
        let cfg = PumpBuilder::new()
            .directives("-THREADS=3 TASKS=5 IN_BUF_SIZE=4k OUTPUTS=2 OUT_BUF_SIZE[1]=3x REC_SIZE=10")
            .unwrap()
            .config()
            .unwrap();
        assert_eq!(cfg.threads, 3);
        assert_eq!(cfg.tasks, 5);
        assert_eq!(cfg.in_buffers, 5);
        assert_eq!(cfg.in_buf_size, 4096);
        assert_eq!(cfg.outputs[0].buf_size, 8192);
        assert_eq!(cfg.outputs[1].buf_size, 3 * 4096);
        assert_eq!(cfg.record_mode, RecordMode::Fixed(10));
    }

    #[test]
    fn test_out_file_without_index_is_output_zero() {
        let cfg = PumpBuilder::new()
            .directives("OUT=result.txt IN_FILE=<stdin> group_by")
            .unwrap()
            .config()
            .unwrap();
        assert_eq!(cfg.outputs[0].file.as_deref(), Some("result.txt"));
        assert_eq!(cfg.in_file.as_deref(), Some("<stdin>"));
        assert_eq!(cfg.group_by, Some(1));
    }

    #[test]
    fn test_unrecognized_keyword() {
        let err = PumpBuilder::new().directives("FROB=1").unwrap_err();
        assert!(matches!(err, PumpError::Syntax(_)));
    }

    #[test]
    fn test_bad_number() {
        let err = PumpBuilder::new().directives("THREADS=lots").unwrap_err();
        assert!(matches!(err, PumpError::Syntax(_)));
    }

    #[test]
    fn test_multiple_record_types() {
        let err = PumpBuilder::new().fixed(8).whole_buffer().config().unwrap_err();
        assert!(matches!(err, PumpError::Config(_)));
    }

    #[test]
    fn test_fixed_requires_size() {
        let err = PumpBuilder::new().fixed(0).config().unwrap_err();
        assert!(matches!(err, PumpError::Config(_)));
    }

    #[test]
    fn test_output_index_out_of_range() {
        let err = PumpBuilder::new()
            .outputs(1)
            .out_buf_size(1, OutBufSize::Bytes(10))
            .config()
            .unwrap_err();
        assert!(matches!(err, PumpError::Config(_)));
    }

    #[test]
    fn test_whole_buffer_cannot_group() {
        let err = PumpBuilder::new().whole_buffer().group_by(1).config().unwrap_err();
        assert!(matches!(err, PumpError::Config(_)));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("12").unwrap(), 12);
        assert_eq!(parse_size("2K").unwrap(), 2048);
        assert_eq!(parse_size("1m").unwrap(), 1 << 20);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("7q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_multi_byte_delimiter_rejected() {
        let err = PumpBuilder::new().directives("DELIM=ab").unwrap_err();
        assert!(matches!(err, PumpError::Config(_)));
    }
}
