#![allow(dead_code)]

use pump_pipeline::{Pump, Result};

/// Install a test logger; `RUST_LOG=pump_pipeline=trace` shows engine traces.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// Read output `index` until end of output.
pub fn drain(pump: &Pump, index: usize) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut buf = [0u8; 1000];
    loop {
        let n = pump.read_output(index, &mut buf)?;
        if n == 0 {
            return Ok(result);
        }
        result.extend_from_slice(&buf[..n]);
    }
}

/// Write `input` in `chunk`-byte pieces and declare EOF on one thread while
/// every output is drained on its own thread. Returns the outputs in index order.
pub fn run(pump: &Pump, input: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    crossbeam::scope(|s| {
        s.spawn(|_| {
            for piece in input.chunks(chunk.max(1)) {
                pump.write_input(piece).expect("write_input failed");
            }
            pump.close_input().expect("close_input failed");
        });
        let readers: Vec<_> = (0..pump.num_outputs())
            .map(|i| s.spawn(move |_| drain(pump, i).expect("read_output failed")))
            .collect();
        readers
            .into_iter()
            .map(|r| r.join().expect("reader panicked"))
            .collect()
    })
    .expect("scope failed")
}

/// Newline-terminated lines `prefix0`, `prefix1`, ...
pub fn numbered_lines(prefix: &str, count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|i| format!("{prefix}{i}\n").into_bytes())
        .collect()
}
