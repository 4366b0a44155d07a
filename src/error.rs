use thiserror::Error;

/// Result type for pump operations
pub type Result<T> = std::result::Result<T, PumpError>;

/// Errors that can occur while configuring or running a pump.
///
/// The first error raised inside a running instance is latched and handed back,
/// unchanged, to every later caller. That is why the type is `Clone` and why
/// I/O failures are carried as rendered messages instead of `std::io::Error`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PumpError {
    /// Reading from an input source failed
    #[error("file read error: {0}")]
    FileRead(String),

    /// Writing a drained output to its destination failed
    #[error("file write error: {0}")]
    FileWrite(String),

    /// The upstream producer signalled a failure instead of a clean EOF
    #[error("upstream error: {0}")]
    Upstream(String),

    /// EOF was declared more than once
    #[error("redundant eof: {0}")]
    RedundantEof(String),

    /// An input or output file could not be opened
    #[error("file open error: {0}")]
    FileOpen(String),

    /// Forwarding bytes into a downstream instance failed
    #[error("write error: {0}")]
    Write(String),

    /// The sort engine rejected its definition
    #[error("sort definition error: {0}")]
    SortDefinition(String),

    /// The sort engine failed while running
    #[error("sort execution error: {0}")]
    SortExecution(String),

    /// A link joined a key-difference output to an ungrouped input, or the reverse
    #[error("group-by mismatch: {0}")]
    GroupByMismatch(String),

    /// A buffer-at-a-time call was made on a sort instance
    #[error("operation incompatible with a sort instance: {0}")]
    SortIncompatible(String),

    /// An input buffer index outside the currently fillable window
    #[error("buffer index error: {0}")]
    BufIndex(String),

    /// An output index at or beyond the configured number of outputs
    #[error("output index error: {0}")]
    OutputIndex(String),

    /// Invalid configuration detected before any thread was started
    #[error("configuration error: {0}")]
    Config(String),

    /// A directive string could not be parsed
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A pump function raised an error
    #[error("pump function error: {0}")]
    PumpFunction(String),

    /// Input ended in the middle of a record
    #[error("partial record at end of input: {bytes} trailing bytes")]
    PartialRecord {
        /// Number of bytes in the incomplete record
        bytes: usize,
    },
}

impl PumpError {
    /// Numeric status code for callers that speak in codes.
    pub fn code(&self) -> i32 {
        match self {
            PumpError::FileRead(_) => -1,
            PumpError::FileWrite(_) => -2,
            PumpError::Upstream(_) => -3,
            PumpError::RedundantEof(_) => -4,
            PumpError::FileOpen(_) => -6,
            PumpError::Write(_) => -7,
            PumpError::SortDefinition(_) => -8,
            PumpError::SortExecution(_) => -9,
            PumpError::GroupByMismatch(_) => -10,
            PumpError::SortIncompatible(_) => -11,
            PumpError::BufIndex(_) => -12,
            PumpError::OutputIndex(_) => -13,
            PumpError::Config(_) => -14,
            PumpError::Syntax(_) => -15,
            PumpError::PumpFunction(_) | PumpError::PartialRecord { .. } => -1000,
        }
    }

    /// Short description of an error code, used when no message was recorded.
    pub fn describe_code(code: i32) -> &'static str {
        match code {
            0 => "no error",
            -1 => "file read error",
            -2 => "file write error",
            -3 => "upstream error",
            -4 => "redundant eof",
            -6 => "file open error",
            -7 => "write error",
            -8 => "sort definition error",
            -9 => "sort execution error",
            -10 => "group-by mismatch",
            -11 => "a sort instance is incompatible with buffer-at-a-time i/o",
            -12 => "the specified buffer index is out of range",
            -13 => "the specified output index is out of range",
            -14 => "an error occurred while starting the pump",
            -15 => "directive syntax error",
            -1000 => "pump function error",
            _ => "unknown error",
        }
    }
}

/// Report a broken internal invariant and abort the process.
///
/// Used only for engine defects, never for data or caller errors.
pub(crate) fn fatal(msg: &str) -> ! {
    log::error!("fatal: {msg}");
    eprintln!("pump-pipeline: fatal internal error: {msg}");
    std::process::abort()
}
