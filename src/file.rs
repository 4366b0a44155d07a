//! File threads: feed a pump's input from a reader, drain an output into a writer.
//!
//! `<stdin>`, `<stdout>` and `<stderr>` name the standard streams wherever a
//! path is accepted.

use crate::error::{PumpError, Result};
use crate::pipeline::{Pump, Shared};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Bytes moved per `read_output` call by a sink.
const SINK_TRANSFER_SIZE: usize = 4096;

pub(crate) fn open_source(path: &str) -> Result<Box<dyn Read + Send>> {
    if path == "<stdin>" {
        return Ok(Box::new(io::stdin()));
    }
    File::open(path)
        .map(|f| Box::new(f) as Box<dyn Read + Send>)
        .map_err(|e| PumpError::FileOpen(format!("{path}: {e}")))
}

pub(crate) fn open_sink(path: &str) -> Result<Box<dyn Write + Send>> {
    match path {
        "<stdout>" => Ok(Box::new(io::stdout())),
        "<stderr>" => Ok(Box::new(io::stderr())),
        _ => File::create(path)
            .map(|f| Box::new(BufWriter::new(f)) as Box<dyn Write + Send>)
            .map_err(|e| PumpError::FileOpen(format!("{path}: {e}"))),
    }
}

/// A thread reading a file straight into a pump's input buffers.
///
/// A source created here is not joined by [`Pump::wait`]; call
/// [`FileSource::join`].
#[derive(Debug)]
pub struct FileSource {
    name: String,
    handle: Option<JoinHandle<Result<()>>>,
}

impl FileSource {
    /// Open `path` (or `<stdin>`) and feed it to `pump`.
    pub fn open(pump: &Pump, path: &str) -> Result<FileSource> {
        let reader = open_source(path)?;
        Self::spawn_shared(Arc::clone(pump.shared()), path.to_string(), reader)
    }

    /// Feed everything `reader` yields to `pump`, then declare input EOF.
    pub fn spawn<R>(pump: &Pump, name: impl Into<String>, reader: R) -> Result<FileSource>
    where
        R: Read + Send + 'static,
    {
        Self::spawn_shared(Arc::clone(pump.shared()), name.into(), Box::new(reader))
    }

    pub(crate) fn spawn_shared(
        shared: Arc<Shared>,
        name: String,
        reader: Box<dyn Read + Send>,
    ) -> Result<FileSource> {
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name("pump-source".into())
            .spawn(move || feed(&shared, &thread_name, reader))
            .map_err(|e| PumpError::Config(format!("failed to spawn source thread for {name}: {e}")))?;
        Ok(FileSource {
            name,
            handle: Some(handle),
        })
    }

    /// Name of the file being read
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the source to reach EOF or fail.
    pub fn join(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| PumpError::FileRead(format!("{}: reader thread panicked", self.name)))?
    }
}

fn feed(shared: &Shared, name: &str, mut reader: Box<dyn Read + Send>) -> Result<()> {
    let mut index = shared.state.lock().buf_readable;
    loop {
        let mut buf = shared.acquire_in_buf(index)?;
        let n = match read_full(&mut reader, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                let err = PumpError::FileRead(format!("{name}: {e}"));
                shared.raise(err.clone());
                return Err(err);
            }
        };
        let eof = n < buf.len();
        shared.put_in_buf(index, buf, n, eof)?;
        if eof {
            log::debug!("{name}: eof after {} input buffers", index + 1);
            return Ok(());
        }
        index += 1;
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// A thread draining one pump output into a writer.
///
/// A sink created here is not joined by [`Pump::wait`]; the output file is
/// complete only once [`FileSink::join`] returns.
#[derive(Debug)]
pub struct FileSink {
    name: String,
    index: usize,
    handle: Option<JoinHandle<Result<()>>>,
}

impl FileSink {
    /// Create `path` (or use `<stdout>`/`<stderr>`) and drain output `index` into it.
    pub fn create(pump: &Pump, index: usize, path: &str) -> Result<FileSink> {
        let writer = open_sink(path)?;
        Self::spawn_shared(Arc::clone(pump.shared()), index, path.to_string(), writer)
    }

    /// Drain output `index` of `pump` into `writer` until end of output.
    pub fn spawn<W>(pump: &Pump, index: usize, name: impl Into<String>, writer: W) -> Result<FileSink>
    where
        W: Write + Send + 'static,
    {
        if index >= pump.num_outputs() {
            return Err(PumpError::OutputIndex(format!(
                "output index {index} is not less than the number of outputs {}",
                pump.num_outputs()
            )));
        }
        Self::spawn_shared(Arc::clone(pump.shared()), index, name.into(), Box::new(writer))
    }

    pub(crate) fn spawn_shared(
        shared: Arc<Shared>,
        index: usize,
        name: String,
        writer: Box<dyn Write + Send>,
    ) -> Result<FileSink> {
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("pump-sink-{index}"))
            .spawn(move || drain(&shared, index, &thread_name, writer))
            .map_err(|e| PumpError::Config(format!("failed to spawn sink thread for {name}: {e}")))?;
        Ok(FileSink {
            name,
            index,
            handle: Some(handle),
        })
    }

    /// Name of the file being written
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Output drained by this sink
    pub fn index(&self) -> usize {
        self.index
    }

    /// Wait for the sink to reach end of output or fail.
    pub fn join(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| PumpError::FileWrite(format!("{}: writer thread panicked", self.name)))?
    }
}

fn drain(shared: &Shared, index: usize, name: &str, mut writer: Box<dyn Write + Send>) -> Result<()> {
    let mut buf = vec![0u8; SINK_TRANSFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = shared.read_output(index, &mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(|e| write_failed(shared, name, e))?;
        total += n as u64;
    }
    writer.flush().map_err(|e| write_failed(shared, name, e))?;
    log::debug!("{name}: output {index} drained, {total} bytes");
    Ok(())
}

fn write_failed(shared: &Shared, name: &str, e: io::Error) -> PumpError {
    let err = PumpError::FileWrite(format!("{name}: {e}"));
    shared.raise(err.clone());
    err
}
