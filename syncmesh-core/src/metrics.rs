//! Prometheus metrics
//!
//! Lock-free counters, gauges and histograms rendered in the text
//! exposition format on `/metrics`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Anything that can be written to the exposition output
pub trait Metric: Send + Sync {
    fn render(&self, out: &mut String);
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Monotonically increasing counter
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Counter {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Value that can go up or down
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Gauge {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Latency histogram with cumulative buckets (seconds)
pub struct Histogram {
    bounds: &'static [f64],
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
    name: &'static str,
    help: &'static str,
}

/// Buckets suited to store round trips and agent RPCs
pub const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Buckets suited to sync executions, which fetch remote repositories
pub const SYNC_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];

impl Histogram {
    pub fn new(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name,
            help,
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        let secs = elapsed.as_secs_f64();
        for (bound, count) in self.bounds.iter().zip(&self.buckets) {
            if secs <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for Histogram {
    fn render(&self, out: &mut String) {
        header(out, self.name, self.help, "histogram");
        for (bound, count) in self.bounds.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                self.name,
                bound,
                count.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, self.count());
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, self.count());
    }
}

/// Process-wide syncmesh metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    // Dispatcher / manager
    pub static TASKS: Gauge = Gauge::new("syncmesh_tasks", "Tasks held by the local dispatcher");

    pub static KNOWN_AGENTS: Gauge =
        Gauge::new("syncmesh_known_agents", "Agents present on the dispatcher ring");

    pub static IS_MASTER: Gauge =
        Gauge::new("syncmesh_is_master", "1 while this replica holds the master lease");

    pub static LEASE_ACQUISITIONS: Counter = Counter::new(
        "syncmesh_lease_acquisitions_total",
        "Times this replica won the master lease",
    );

    pub static MESSAGES_PUBLISHED: Counter = Counter::new(
        "syncmesh_messages_published_total",
        "Task messages published to peers",
    );

    pub static MESSAGES_APPLIED: Counter = Counter::new(
        "syncmesh_messages_applied_total",
        "Task messages received from peers and applied",
    );

    pub static TASK_PUSHES: Counter =
        Counter::new("syncmesh_task_pushes_total", "Task lists pushed to agents");

    pub static TASK_PUSH_FAILURES: Counter = Counter::new(
        "syncmesh_task_push_failures_total",
        "Task list pushes that failed",
    );

    pub static PUSH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "syncmesh_push_duration_seconds",
            "Duration of one push round to all agents",
            LATENCY_BUCKETS,
        )
    });

    // Registry
    pub static REGISTERED_AGENTS: Gauge =
        Gauge::new("syncmesh_registered_agents", "Live entries in the registry cache");

    // Agent
    pub static SYNC_EXECUTIONS: Counter =
        Counter::new("syncmesh_sync_executions_total", "Sync tasks executed");

    pub static SYNC_FAILURES: Counter =
        Counter::new("syncmesh_sync_failures_total", "Sync tasks that failed");

    pub static SYNC_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new(
            "syncmesh_sync_duration_seconds",
            "Duration of one sync execution",
            SYNC_BUCKETS,
        )
    });

    pub static HEARTBEAT_FAILURES: Counter = Counter::new(
        "syncmesh_heartbeat_failures_total",
        "Registry heartbeats that failed",
    );
}

/// Render every standard metric
pub fn gather_system_metrics() -> String {
    use standard::*;

    let metrics: [&dyn Metric; 14] = [
        &TASKS,
        &KNOWN_AGENTS,
        &IS_MASTER,
        &LEASE_ACQUISITIONS,
        &MESSAGES_PUBLISHED,
        &MESSAGES_APPLIED,
        &TASK_PUSHES,
        &TASK_PUSH_FAILURES,
        &*PUSH_DURATION,
        &REGISTERED_AGENTS,
        &SYNC_EXECUTIONS,
        &SYNC_FAILURES,
        &*SYNC_DURATION,
        &HEARTBEAT_FAILURES,
    ];

    let mut output = String::new();
    for metric in metrics {
        metric.render(&mut output);
    }
    output
}
