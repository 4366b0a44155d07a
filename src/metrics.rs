use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tasks kept for the duration quantiles
const TASK_WINDOW: usize = 1024;

/// Durations of the most recently finished tasks, claim to finish
#[derive(Debug)]
struct TaskTimes {
    ring: Box<[u64]>,
    next: usize,
    filled: usize,
    slowest: u64,
}

impl TaskTimes {
    fn new(window: usize) -> Self {
        Self {
            ring: vec![0; window.max(1)].into_boxed_slice(),
            next: 0,
            filled: 0,
            slowest: 0,
        }
    }

    fn record(&mut self, nanos: u64) {
        self.ring[self.next] = nanos;
        self.next = (self.next + 1) % self.ring.len();
        self.filled = (self.filled + 1).min(self.ring.len());
        self.slowest = self.slowest.max(nanos);
    }

    /// Nearest-rank quantiles of the window, one sort for all of them.
    fn quantiles<const N: usize>(&self, ps: [f64; N]) -> [Duration; N] {
        let mut sorted = self.ring[..self.filled].to_vec();
        sorted.sort_unstable();
        ps.map(|p| {
            let rank = (sorted.len() as f64 * p).ceil() as usize;
            sorted
                .get(rank.saturating_sub(1))
                .map_or(Duration::ZERO, |&n| Duration::from_nanos(n))
        })
    }
}

/// Per-instance counters, shared by the producer, the workers and the consumers
#[derive(Debug, Clone)]
pub struct PumpMetrics {
    tasks: Arc<AtomicU64>,
    records: Arc<AtomicU64>,
    bytes_in: Arc<AtomicU64>,
    bytes_out: Arc<AtomicU64>,
    /// Producer waits for a free input buffer or task slot
    producer_blocks: Arc<AtomicU64>,
    /// Worker waits for a full output buffer to be drained
    stalls: Arc<AtomicU64>,
    invocations: Arc<AtomicU64>,
    task_times: Arc<Mutex<TaskTimes>>,
    start_time: Instant,
}

impl PumpMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(AtomicU64::new(0)),
            records: Arc::new(AtomicU64::new(0)),
            bytes_in: Arc::new(AtomicU64::new(0)),
            bytes_out: Arc::new(AtomicU64::new(0)),
            producer_blocks: Arc::new(AtomicU64::new(0)),
            stalls: Arc::new(AtomicU64::new(0)),
            invocations: Arc::new(AtomicU64::new(0)),
            task_times: Arc::new(Mutex::new(TaskTimes::new(TASK_WINDOW))),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_task(&self, elapsed: Duration) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.task_times.lock().record(nanos);
    }

    pub(crate) fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_records(&self, n: u64) {
        self.records.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_out(&self, n: usize) {
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_producer_block(&self) {
        self.producer_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    /// Tasks executed by the worker pool
    pub fn total_tasks(&self) -> u64 {
        self.tasks.load(Ordering::Relaxed)
    }

    /// Pump function invocations; a record-mode task may take several
    pub fn total_invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Records delivered to pump functions
    pub fn total_records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Bytes accepted on the input side
    pub fn total_bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes handed out on the output side, all outputs combined
    pub fn total_bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Times the producer had to wait
    pub fn total_producer_blocks(&self) -> u64 {
        self.producer_blocks.load(Ordering::Relaxed)
    }

    /// Times a worker stalled on a full output buffer
    pub fn total_stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Input throughput in bytes per second since the instance started
    pub fn throughput_bps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_bytes_in() as f64 / elapsed
        }
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (task_quantiles, slowest_task) = {
            let times = self.task_times.lock();
            (
                times.quantiles([0.50, 0.95, 0.99]),
                Duration::from_nanos(times.slowest),
            )
        };
        let [task_p50, task_p95, task_p99] = task_quantiles;
        MetricsSnapshot {
            total_tasks: self.total_tasks(),
            total_invocations: self.total_invocations(),
            total_records: self.total_records(),
            bytes_in: self.total_bytes_in(),
            bytes_out: self.total_bytes_out(),
            producer_blocks: self.total_producer_blocks(),
            stalls: self.total_stalls(),
            throughput_bps: self.throughput_bps(),
            task_p50,
            task_p95,
            task_p99,
            slowest_task,
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for PumpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_tasks: u64,
    pub total_invocations: u64,
    pub total_records: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub producer_blocks: u64,
    pub stalls: u64,
    pub throughput_bps: f64,
    /// Task duration quantiles over the last finished tasks
    pub task_p50: Duration,
    pub task_p95: Duration,
    pub task_p99: Duration,
    pub slowest_task: Duration,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Tasks: {} ({} invocations), Records: {}, In: {} B, Out: {} B, Producer blocks: {}, \
             Stalls: {}, Throughput: {:.2} B/s, Task P50: {:?}, P95: {:?}, P99: {:?}, \
             Slowest: {:?}, Elapsed: {:.2}s",
            self.total_tasks,
            self.total_invocations,
            self.total_records,
            self.bytes_in,
            self.bytes_out,
            self.producer_blocks,
            self.stalls,
            self.throughput_bps,
            self.task_p50,
            self.task_p95,
            self.task_p99,
            self.slowest_task,
            self.elapsed.as_secs_f64()
        )
    }
}
