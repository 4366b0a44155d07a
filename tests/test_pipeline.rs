mod common;

use common::{drain, init_logging, numbered_lines, run};
use pump_pipeline::{
    FileSink, OutBufSize, PassthroughPump, Pump, PumpBuilder, PumpError, Result as PumpResult,
    Task,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn uppercase(task: &mut Task<'_>) -> PumpResult<()> {
    let mut rec = Vec::new();
    while task.read_record(&mut rec)? {
        task.write(0, &rec.to_ascii_uppercase())?;
    }
    Ok(())
}

#[test]
fn test_uppercase_single_thread() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(1)
        .build_fn(uppercase)
        .expect("Pump start failed");

    pump.write_input(b"a\nbb\nccc\n").expect("Write failed");
    pump.close_input().expect("Close failed");
    let out = drain(&pump, 0).expect("Read failed");
    assert_eq!(out, b"A\nBB\nCCC\n");
    pump.wait().expect("Wait failed");
}

#[test]
fn test_uppercase_many_threads_small_buffers() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(8)
        .tasks(4)
        .in_buffers(5)
        .in_buf_size(16)
        .build_fn(uppercase)
        .expect("Pump start failed");

    let input = numbered_lines("line ", 2000);
    let outputs = run(&pump, &input, 37);
    assert_eq!(outputs[0], input.to_ascii_uppercase());
    pump.wait().expect("Wait failed");

    let snapshot = pump.metrics().snapshot();
    assert_eq!(snapshot.total_records, 2000);
    assert_eq!(snapshot.bytes_in, input.len() as u64);
    assert_eq!(snapshot.bytes_out, input.len() as u64);
    assert!(snapshot.total_tasks > 1);
    assert!(snapshot.total_invocations >= snapshot.total_tasks);
    assert!(snapshot.task_p50 <= snapshot.task_p99);
    assert!(snapshot.task_p99 <= snapshot.slowest_task);
}

#[test]
fn test_multiple_outputs_keep_order() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(4)
        .in_buf_size(64)
        .outputs(2)
        .build_fn(|task: &mut Task<'_>| {
            let mut rec = Vec::new();
            while task.read_record(&mut rec)? {
                let digit = rec[rec.len() - 2] - b'0';
                task.write(usize::from(digit % 2), &rec)?;
            }
            Ok(())
        })
        .expect("Pump start failed");

    let input = numbered_lines("n", 500);
    let outputs = run(&pump, &input, 100);
    pump.wait().expect("Wait failed");

    let lines = |out: &[u8]| -> Vec<String> {
        String::from_utf8(out.to_vec())
            .expect("utf8")
            .lines()
            .map(str::to_string)
            .collect()
    };
    let evens: Vec<String> = (0..500)
        .filter(|i| i % 2 == 0)
        .map(|i| format!("n{i}"))
        .collect();
    let odds: Vec<String> = (0..500)
        .filter(|i| i % 2 == 1)
        .map(|i| format!("n{i}"))
        .collect();
    assert_eq!(lines(&outputs[0]), evens);
    assert_eq!(lines(&outputs[1]), odds);
}

#[test]
fn test_whole_buffer_mode() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(3)
        .whole_buffer()
        .in_buf_size(10)
        .build_fn(|task: &mut Task<'_>| {
            let seq = task.task_number();
            let chunk = task.take_input()?;
            task.write_fmt(0, format_args!("{seq}:{}\n", chunk.len()))?;
            Ok(())
        })
        .expect("Pump start failed");

    let input = vec![b'x'; 35];
    let outputs = run(&pump, &input, 7);
    pump.wait().expect("Wait failed");
    assert_eq!(outputs[0], b"0:10\n1:10\n2:10\n3:5\n");
}

#[test]
fn test_take_input_rejected_in_record_mode() {
    init_logging();
    // records straddle the 4-byte buffers, so later tasks start mid-buffer
    let pump = PumpBuilder::new()
        .threads(2)
        .in_buf_size(4)
        .build_fn(|task: &mut Task<'_>| {
            let chunk = task.take_input()?;
            task.write(0, &chunk)?;
            Ok(())
        })
        .expect("Pump start failed");

    // the producer may already see the latched error
    let _ = pump.write_input(b"ab\ncd\nef\n");
    let _ = pump.close_input();
    let err = drain(&pump, 0).unwrap_err();
    assert!(matches!(err, PumpError::PumpFunction(_)), "got {err:?}");
    assert_eq!(pump.wait().unwrap_err(), err);
}

#[test]
fn test_output_larger_than_buffer_stalls() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(2)
        .in_buf_size(32)
        .out_buf_size(0, OutBufSize::Bytes(4))
        .build_fn(|task: &mut Task<'_>| {
            let mut rec = Vec::new();
            while task.read_record(&mut rec)? {
                for _ in 0..25 {
                    task.write(0, &rec)?;
                }
            }
            Ok(())
        })
        .expect("Pump start failed");

    let input = b"ab\ncd\nef\ngh\n";
    let outputs = run(&pump, input, input.len());
    pump.wait().expect("Wait failed");

    let expected: Vec<u8> = ["ab\n", "cd\n", "ef\n", "gh\n"]
        .iter()
        .flat_map(|rec| rec.repeat(25).into_bytes())
        .collect();
    assert_eq!(outputs[0], expected);
    assert!(pump.metrics().total_stalls() > 0);
}

#[test]
fn test_output_window_and_commit() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(2)
        .out_buf_size(0, OutBufSize::Bytes(3))
        .build_fn(|task: &mut Task<'_>| {
            let mut rec = Vec::new();
            while task.read_record(&mut rec)? {
                let mut rest = &rec[..];
                while !rest.is_empty() {
                    let window = task.output_window(0)?;
                    let n = window.len().min(rest.len());
                    window[..n].copy_from_slice(&rest[..n]);
                    task.commit(0, n)?;
                    rest = &rest[n..];
                }
            }
            Ok(())
        })
        .expect("Pump start failed");

    let input = numbered_lines("window-", 50);
    let outputs = run(&pump, &input, 64);
    pump.wait().expect("Wait failed");
    assert_eq!(outputs[0], input);
}

#[test]
fn test_byte_source_collaborator() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(2)
        .in_buffers(3)
        .in_buf_size(8)
        .build(PassthroughPump)
        .expect("Pump start failed");
    let input = numbered_lines("rec", 40);

    let out = crossbeam::scope(|s| {
        s.spawn(|_| {
            let mut index = 0;
            for piece in input.chunks(8) {
                let mut buf = pump.acquire_in_buf(index).expect("Acquire failed");
                assert_eq!(buf.len(), 8);
                buf[..piece.len()].copy_from_slice(piece);
                let eof = piece.len() < 8;
                pump.put_in_buf(index, buf, piece.len(), eof)
                    .expect("Put failed");
                index += 1;
            }
            if input.len() % 8 == 0 {
                let buf = pump.acquire_in_buf(index).expect("Acquire failed");
                pump.put_in_buf(index, buf, 0, true).expect("Put failed");
            }
        });
        drain(&pump, 0).expect("Read failed")
    })
    .expect("scope failed");

    assert_eq!(out, input);
    pump.wait().expect("Wait failed");
}

#[test]
fn test_buffer_index_validation() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(1)
        .in_buffers(2)
        .in_buf_size(8)
        .build(PassthroughPump)
        .expect("Pump start failed");

    let err = pump.acquire_in_buf(2).unwrap_err();
    assert!(matches!(err, PumpError::BufIndex(_)));

    let buf = pump.acquire_in_buf(1).expect("Acquire failed");
    let err = pump.put_in_buf(1, buf, 0, false).unwrap_err();
    assert!(matches!(err, PumpError::BufIndex(_)));

    // caller errors are not latched
    assert!(pump.error().is_none());
    pump.close_input().expect("Close failed");
    assert!(drain(&pump, 0).expect("Read failed").is_empty());
    pump.wait().expect("Wait failed");
}

#[test]
fn test_pump_function_error_is_sticky() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(2)
        .build_fn(|task: &mut Task<'_>| {
            let mut rec = Vec::new();
            while task.read_record(&mut rec)? {
                if rec == b"bad\n" {
                    return Err(task.fail("found a bad record"));
                }
                task.write(0, &rec)?;
            }
            Ok(())
        })
        .expect("Pump start failed");

    pump.write_input(b"good\nbad\ngood\n").expect("Write failed");
    pump.close_input().expect("Close failed");

    let err = drain(&pump, 0).unwrap_err();
    assert_eq!(err, PumpError::PumpFunction("found a bad record".into()));
    assert_eq!(pump.wait().unwrap_err(), err);
    assert_eq!(pump.error(), Some(err.clone()));
    assert!(pump.error_message().contains("found a bad record"));
    assert_eq!(err.code(), -1000);
}

#[test]
fn test_panicking_pump_function() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(1)
        .build_fn(|task: &mut Task<'_>| {
            let mut rec = Vec::new();
            task.read_record(&mut rec)?;
            panic!("pump function bug");
        })
        .expect("Pump start failed");

    pump.write_input(b"x\n").expect("Write failed");
    pump.close_input().expect("Close failed");
    let err = drain(&pump, 0).unwrap_err();
    assert!(matches!(err, PumpError::PumpFunction(_)));
    assert!(pump.wait().is_err());
}

#[test]
fn test_invocation_without_progress_fails() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(1)
        .build_fn(|_task: &mut Task<'_>| Ok(()))
        .expect("Pump start failed");

    pump.write_input(b"x\n").expect("Write failed");
    pump.close_input().expect("Close failed");
    let err = drain(&pump, 0).unwrap_err();
    assert!(matches!(err, PumpError::PumpFunction(_)));
}

#[test]
fn test_fail_input_unblocks_consumer() {
    init_logging();
    let pump = PumpBuilder::new()
        .threads(2)
        .build(PassthroughPump)
        .expect("Pump start failed");

    crossbeam::scope(|s| {
        let reader = s.spawn(|_| drain(&pump, 0));
        std::thread::sleep(Duration::from_millis(20));
        pump.fail_input("source went away");
        let err = reader.join().expect("reader panicked").unwrap_err();
        assert_eq!(err, PumpError::Upstream("source went away".into()));
    })
    .expect("scope failed");
    assert!(pump.wait().is_err());
}

#[test]
fn test_start_with_directives() {
    init_logging();
    let pump = Pump::start("-THREADS=2 OUTPUTS=2 IN_BUF_SIZE=1k", |task: &mut Task<'_>| {
        let mut rec = Vec::new();
        while task.read_record(&mut rec)? {
            task.write(0, &rec)?;
            task.write(1, &rec[..rec.len() - 1])?;
        }
        Ok(())
    })
    .expect("Pump start failed");

    assert_eq!(pump.config().in_buf_size, 1024);
    let outputs = run(&pump, b"a\nb\nc\n", 2);
    pump.wait().expect("Wait failed");
    assert_eq!(outputs[0], b"a\nb\nc\n");
    assert_eq!(outputs[1], b"abc");
}

#[test]
fn test_bad_directive_reports_syntax_error() {
    let err = Pump::start("THREADS=2 BOGUS", uppercase).err();
    assert!(matches!(err, Some(PumpError::Syntax(_))));
}

#[test]
fn test_user_lock_is_exclusive() {
    init_logging();
    let inside = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));
    let (inside_fn, most_fn) = (Arc::clone(&inside), Arc::clone(&most));

    let pump = PumpBuilder::new()
        .threads(4)
        .in_buf_size(8)
        .build_fn(move |task: &mut Task<'_>| {
            let mut rec = Vec::new();
            let seq = task.task_number();
            while task.read_record(&mut rec)? {
                {
                    let _guard = task.user_lock();
                    let now = inside_fn.fetch_add(1, Ordering::SeqCst) + 1;
                    most_fn.fetch_max(now, Ordering::SeqCst);
                    std::thread::yield_now();
                    inside_fn.fetch_sub(1, Ordering::SeqCst);
                }
                task.write_fmt(0, format_args!("{seq}\n"))?;
            }
            Ok(())
        })
        .expect("Pump start failed");

    let outputs = run(&pump, &numbered_lines("", 200), 50);
    pump.wait().expect("Wait failed");
    assert_eq!(most.load(Ordering::SeqCst), 1);

    let numbers: Vec<u64> = String::from_utf8(outputs[0].clone())
        .expect("utf8")
        .lines()
        .map(|l| l.parse().expect("task number"))
        .collect();
    assert_eq!(numbers.len(), 200);
    assert!(numbers.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_file_wiring() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let in_path = dir.path().join("in.txt");
    let out_path = dir.path().join("out.txt");
    let input = numbered_lines("file line ", 300);
    std::fs::write(&in_path, &input).expect("write input");

    let directives = format!(
        "THREADS=3 IN_BUF_SIZE=100 IN_FILE={} OUT_FILE[0]={}",
        in_path.display(),
        out_path.display()
    );
    let pump = Pump::start(&directives, uppercase).expect("Pump start failed");
    pump.wait().expect("Wait failed");

    let out = std::fs::read(&out_path).expect("read output");
    assert_eq!(out, input.to_ascii_uppercase());
}

#[test]
fn test_missing_input_file() {
    let err = Pump::start("IN_FILE=/nonexistent/pump/input.txt", uppercase).err();
    assert!(matches!(err, Some(PumpError::FileOpen(_))));
}

#[test]
fn test_file_sink_thread() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let out_path = dir.path().join("sink.txt");

    let pump = PumpBuilder::new()
        .threads(2)
        .build(PassthroughPump)
        .expect("Pump start failed");
    let sink = FileSink::create(&pump, 0, out_path.to_str().expect("path"))
        .expect("Sink start failed");
    assert_eq!(sink.index(), 0);

    let input = numbered_lines("s", 100);
    pump.write_input(&input).expect("Write failed");
    pump.close_input().expect("Close failed");
    sink.join().expect("Sink failed");
    pump.wait().expect("Wait failed");

    assert_eq!(std::fs::read(&out_path).expect("read output"), input);
}

#[test]
fn test_caller_owned_sink_outlives_wait() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let out_path = dir.path().join("late-sink.txt");

    let pump = PumpBuilder::new()
        .threads(2)
        .in_buf_size(64)
        .build(PassthroughPump)
        .expect("Pump start failed");
    let sink = FileSink::spawn(
        &pump,
        0,
        "late-sink",
        SlowWriter(std::fs::File::create(&out_path).expect("create output")),
    )
    .expect("Sink start failed");

    let input = numbered_lines("w", 200);
    pump.write_input(&input).expect("Write failed");
    pump.close_input().expect("Close failed");
    // wait covers the workers only, the sink stays with the caller
    pump.wait().expect("Wait failed");
    sink.join().expect("Sink failed");

    assert_eq!(std::fs::read(&out_path).expect("read output"), input);
}

/// Writer that sleeps on every write, so the sink lags behind the workers.
struct SlowWriter<W>(W);

impl<W: std::io::Write> std::io::Write for SlowWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_millis(2));
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}
