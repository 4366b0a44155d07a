//! Links: a thread forwarding one pump's output into another pump's input.

use crate::error::{PumpError, Result};
use crate::pipeline::{Pump, Shared};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Bytes moved per forwarding step.
const LINK_BUF_SIZE: usize = 4096;

/// A running connection from an output of one pump to the input of another.
///
/// EOF on the upstream output becomes EOF on the downstream input; an
/// upstream error becomes an upstream error downstream.
#[derive(Debug)]
pub struct Link {
    out_index: usize,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Link {
    /// Start forwarding output `out_index` of `from` into `to`.
    ///
    /// Key-difference annotated output must feed a grouped pump and a grouped
    /// pump must be fed key-difference annotated output.
    pub fn start(from: &Pump, out_index: usize, to: &Pump) -> Result<Link> {
        let key_diff = from.key_diff_output();
        let grouped = to.config().is_grouped();
        if key_diff != grouped {
            return Err(PumpError::GroupByMismatch(format!(
                "upstream key-difference output is {key_diff} but downstream grouping is {grouped}"
            )));
        }
        if out_index >= from.num_outputs() {
            return Err(PumpError::OutputIndex(format!(
                "output index {out_index} is not less than the number of outputs {}",
                from.num_outputs()
            )));
        }

        let src = Arc::clone(from.shared());
        let dst = Arc::clone(to.shared());
        let handle = thread::Builder::new()
            .name(format!("pump-link-{out_index}"))
            .spawn(move || forward(&src, out_index, &dst))
            .map_err(|e| PumpError::Config(format!("failed to spawn link thread: {e}")))?;
        Ok(Link {
            out_index,
            handle: Some(handle),
        })
    }

    /// Upstream output being forwarded
    pub fn out_index(&self) -> usize {
        self.out_index
    }

    /// Wait for the link to reach EOF or fail.
    pub fn join(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| PumpError::Write("link thread panicked".into()))?
    }
}

fn forward(src: &Shared, out_index: usize, dst: &Shared) -> Result<()> {
    let mut buf = vec![0u8; LINK_BUF_SIZE];
    loop {
        let n = match src.read_output(out_index, &mut buf) {
            Ok(n) => n,
            Err(err) => {
                log::debug!("link from output {out_index}: upstream failed: {err}");
                dst.fail_input(format!("upstream output {out_index} failed: {err}"));
                return Err(PumpError::Upstream(err.to_string()));
            }
        };
        if n == 0 {
            log::debug!("link from output {out_index}: eof");
            return dst.close_input();
        }

        let written = match dst.write_input(&buf[..n]) {
            Ok(written) => written,
            Err(err) => {
                let err = PumpError::Write(format!("downstream input rejected {n} bytes: {err}"));
                src.raise(err.clone());
                return Err(err);
            }
        };
        if written != n {
            let err = PumpError::Write(format!("downstream accepted {written} of {n} bytes"));
            src.raise(err.clone());
            dst.fail_input(err.to_string());
            return Err(err);
        }
    }
}
