use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pump_pipeline::{Pump, PumpBuilder, Task};
use std::time::Duration;

fn input_lines(count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|i| format!("record {i:08} with some payload bytes\n").into_bytes())
        .collect()
}

fn uppercase(task: &mut Task<'_>) -> pump_pipeline::Result<()> {
    let mut rec = Vec::new();
    while task.read_record(&mut rec)? {
        rec.make_ascii_uppercase();
        task.write(0, &rec)?;
    }
    Ok(())
}

/// Push `input` through `pump` and drain output 0, returning the bytes read.
fn pump_through(pump: &Pump, input: &[u8]) -> usize {
    crossbeam::scope(|s| {
        s.spawn(|_| {
            for chunk in input.chunks(64 * 1024) {
                pump.write_input(chunk).expect("Write failed");
            }
            pump.close_input().expect("Close failed");
        });
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let n = pump.read_output(0, &mut buf).expect("Read failed");
            if n == 0 {
                break total;
            }
            total += n;
        }
    })
    .expect("scope failed")
}

fn benchmark_thread_sweep(c: &mut Criterion) {
    let input = input_lines(100_000);
    let mut group = c.benchmark_group("uppercase_records");
    group.throughput(Throughput::Bytes(input.len() as u64));

    for threads in [1, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let pump = PumpBuilder::new()
                    .threads(threads)
                    .in_buf_size(64 * 1024)
                    .build_fn(uppercase)
                    .expect("Pump start failed");
                let total = pump_through(&pump, black_box(&input));
                pump.wait().expect("Wait failed");
                assert_eq!(total, input.len());
            });
        });
    }
    group.finish();
}

fn benchmark_whole_buffer(c: &mut Criterion) {
    let input = input_lines(100_000);
    let mut group = c.benchmark_group("whole_buffer_passthrough");
    group.throughput(Throughput::Bytes(input.len() as u64));

    group.bench_function("4_threads", |b| {
        b.iter(|| {
            let pump = PumpBuilder::new()
                .threads(4)
                .whole_buffer()
                .in_buf_size(64 * 1024)
                .build_fn(|task: &mut Task<'_>| {
                    let chunk = task.take_input()?;
                    task.write(0, &chunk)?;
                    Ok(())
                })
                .expect("Pump start failed");
            let total = pump_through(&pump, black_box(&input));
            pump.wait().expect("Wait failed");
            assert_eq!(total, input.len());
        });
    });
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_thread_sweep, benchmark_whole_buffer
);
criterion_main!(benches);
