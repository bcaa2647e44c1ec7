//! Prometheus metrics
//!
//! Process-wide counters, gauges and latency histograms, rendered in the
//! Prometheus text exposition format by the `/metrics` endpoint.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Anything that can write itself into an exposition page
pub trait Metric: Send + Sync {
    fn name(&self) -> &'static str;
    fn render(&self, out: &mut String);
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Monotonic count of events
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Counter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Point-in-time value
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Metric for Gauge {
    fn name(&self) -> &'static str {
        self.name
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Upper bounds, in seconds, for latency histograms
pub const LATENCY_BUCKETS: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];

/// Cumulative latency histogram
///
/// Bucket counts are stored per bucket and accumulated at render time, with an
/// implicit `+Inf` bucket equal to the total count. The sum is kept as the bit
/// pattern of an `f64` so sub-microsecond observations are not truncated.
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    bounds: &'static [f64],
    hits: Vec<AtomicU64>,
    count: AtomicU64,
    sum_bits: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self::with_bounds(name, help, &LATENCY_BUCKETS)
    }

    pub fn with_bounds(name: &'static str, help: &'static str, bounds: &'static [f64]) -> Self {
        Self {
            name,
            help,
            bounds,
            hits: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn observe(&self, value: f64) {
        if let Some(slot) = self.bounds.iter().position(|bound| value <= *bound) {
            self.hits[slot].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
    }

    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }
}

impl Metric for Histogram {
    fn name(&self) -> &'static str {
        self.name
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "histogram");
        let mut cumulative = 0;
        for (bound, hits) in self.bounds.iter().zip(&self.hits) {
            cumulative += hits.load(Ordering::Relaxed);
            let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", self.name, bound, cumulative);
        }
        let count = self.count();
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, count);
        let _ = writeln!(out, "{}_sum {}", self.name, self.sum());
        let _ = writeln!(out, "{}_count {}", self.name, count);
    }
}

/// Metrics exported by every portico process
pub mod standard {
    use super::{Counter, Gauge, Histogram, Metric};
    use std::sync::LazyLock;

    pub static REQUESTS_SUCCEEDED: Counter =
        Counter::new("portico_requests_succeeded_total", "Requests that reached SUCCESS");
    pub static REQUESTS_FAILED: Counter =
        Counter::new("portico_requests_failed_total", "Requests that reached FAILED");
    pub static AGENT_APPLY_ATTEMPTS: Counter =
        Counter::new("portico_agent_apply_attempts_total", "Apply calls sent to agents");
    pub static COMPENSATIONS: Counter = Counter::new(
        "portico_compensations_total",
        "Compensating REMOVE calls sent to agents",
    );
    pub static ELB_REGISTRATIONS: Counter = Counter::new(
        "portico_elb_registrations_total",
        "Instances registered with cloud load balancers",
    );
    pub static ELB_DEREGISTRATIONS: Counter = Counter::new(
        "portico_elb_deregistrations_total",
        "Instances deregistered from cloud load balancers",
    );
    pub static REQUESTS_PURGED: Counter = Counter::new(
        "portico_requests_purged_total",
        "Terminal requests deleted after retention",
    );

    pub static IS_LEADER: Gauge =
        Gauge::new("portico_is_leader", "1 while this process holds the leader lock");
    pub static STUCK_REQUESTS: Gauge = Gauge::new(
        "portico_stuck_requests",
        "Pending requests older than the stuck threshold",
    );

    pub static AGENT_APPLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("portico_agent_apply_duration_seconds", "Agent apply call latency")
    });

    /// Every standard metric, in exposition order
    pub fn all() -> [&'static dyn Metric; 10] {
        [
            &REQUESTS_SUCCEEDED,
            &REQUESTS_FAILED,
            &AGENT_APPLY_ATTEMPTS,
            &COMPENSATIONS,
            &ELB_REGISTRATIONS,
            &ELB_DEREGISTRATIONS,
            &REQUESTS_PURGED,
            &IS_LEADER,
            &STUCK_REQUESTS,
            &*AGENT_APPLY_DURATION,
        ]
    }
}

/// Render the standard set as one exposition page
pub fn gather_system_metrics() -> String {
    let mut out = String::with_capacity(4096);
    for metric in standard::all() {
        metric.render(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        static BOUNDS: [f64; 3] = [0.01, 0.1, 1.0];
        let histogram = Histogram::with_bounds("apply_seconds", "Apply latency", &BOUNDS);

        histogram.observe(0.001);
        histogram.observe_duration(Duration::from_millis(50));
        histogram.observe(0.5);
        histogram.observe(30.0);

        let mut page = String::new();
        histogram.render(&mut page);
        assert!(page.contains("apply_seconds_bucket{le=\"0.01\"} 1\n"));
        assert!(page.contains("apply_seconds_bucket{le=\"0.1\"} 2\n"));
        assert!(page.contains("apply_seconds_bucket{le=\"1\"} 3\n"));
        assert!(page.contains("apply_seconds_bucket{le=\"+Inf\"} 4\n"));
        assert!(page.contains("apply_seconds_count 4\n"));
        assert!((histogram.sum() - 30.551).abs() < 1e-9);
    }

    #[test]
    fn test_counter_and_gauge_render() {
        let counter = Counter::new("events_total", "Events");
        counter.inc();
        counter.inc_by(4);
        let gauge = Gauge::new("depth", "Depth");
        gauge.set(-2);

        let mut page = String::new();
        counter.render(&mut page);
        gauge.render(&mut page);
        assert!(page.contains("# TYPE events_total counter\nevents_total 5\n"));
        assert!(page.contains("# TYPE depth gauge\ndepth -2\n"));
    }

    #[test]
    fn test_gather_includes_standard_set() {
        let page = gather_system_metrics();
        for metric in standard::all() {
            assert!(page.contains(&format!("# HELP {} ", metric.name())));
        }
        assert!(page.contains("portico_agent_apply_duration_seconds_bucket{le=\"+Inf\"}"));
    }
}
