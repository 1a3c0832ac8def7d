use crate::snapshot::{ActionMetrics, MetricsSnapshot, NodeDispatchMetrics};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Instant, SystemTime};

/// One bin per power of two milliseconds, up to ~2^39ms.
const NUM_HISTOGRAM_BINS: usize = 40;

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How a dispatch attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    Failure,
    Timeout,
}

/// Base-2 logarithmic histogram of dispatch latencies.
///
/// Agent calls range from a few milliseconds (PING) to minutes (SPEEDTEST,
/// certificate rotation), so bins double in width. Bin `i` holds samples in
/// `[2^(i-1), 2^i)` milliseconds; bin 0 holds sub-millisecond calls.
///
/// Recording is lock-free. Percentiles are reported as the upper bound of
/// the bin containing the target rank.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_ms: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_ms: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    fn bin_for(latency_ms: u64) -> usize {
        if latency_ms == 0 {
            return 0;
        }
        ((latency_ms.ilog2() + 1) as usize).min(NUM_HISTOGRAM_BINS - 1)
    }

    fn upper_bound(bin: usize) -> u64 {
        1u64 << bin
    }

    fn record(&self, latency_ms: u64) {
        self.bins[Self::bin_for(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.samples.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        // Rank of the sample at this percentile, 1-based.
        let target = ((total * percentile) + 99) / 100;
        let mut seen = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            seen += count.load(Ordering::Relaxed);
            if seen >= target.max(1) {
                return Self::upper_bound(bin);
            }
        }
        Self::upper_bound(NUM_HISTOGRAM_BINS - 1)
    }

    /// `(avg, p50, p95, p99)` in milliseconds
    fn summary(&self) -> (u64, u64, u64, u64) {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return (0, 0, 0, 0);
        }
        let avg = self.total_ms.load(Ordering::Relaxed) / samples;
        (
            avg,
            self.percentile(50),
            self.percentile(95),
            self.percentile(99),
        )
    }
}

#[derive(Debug)]
struct ActionStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    latency: LatencyHistogram,
}

impl ActionStats {
    fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
        }
    }

    fn record(&self, latency_ms: u64, outcome: DispatchOutcome) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match outcome {
            DispatchOutcome::Success => self.successes.fetch_add(1, Ordering::Relaxed),
            DispatchOutcome::Failure => self.failures.fetch_add(1, Ordering::Relaxed),
            DispatchOutcome::Timeout => self.timeouts.fetch_add(1, Ordering::Relaxed),
        };
        self.latency.record(latency_ms);
    }

    fn snapshot(&self) -> ActionMetrics {
        let (avg, p50, p95, p99) = self.latency.summary();
        ActionMetrics {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_latency_ms: avg,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
        }
    }
}

#[derive(Debug, Default)]
struct NodeStats {
    dispatched: AtomicU64,
    failed: AtomicU64,
    last_dispatch_ms: AtomicU64,
}

impl NodeStats {
    fn record(&self, outcome: DispatchOutcome) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        if outcome != DispatchOutcome::Success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.last_dispatch_ms.store(unix_millis(), Ordering::Relaxed);
    }

    fn snapshot(&self, node_id: u64) -> NodeDispatchMetrics {
        NodeDispatchMetrics {
            node_id,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_dispatch_ms: self.last_dispatch_ms.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe storage for dispatch metrics.
///
/// Global counters and per-entry counters are plain atomics with relaxed
/// ordering. The action and node maps are behind a std `RwLock` that is held
/// only long enough to fetch or insert an entry.
///
/// Both key spaces are bounded: actions by the closed action set, nodes by
/// the fleet size. Entries are never evicted.
///
/// # Example
///
/// ```rust
/// use mindvpn_metrics::{DispatchOutcome, MetricsRegistry};
///
/// let registry = MetricsRegistry::new();
/// registry.record_dispatch("PING", 1, 12, DispatchOutcome::Success);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_dispatched, 1);
/// assert_eq!(snapshot.actions["PING"].successes, 1);
/// ```
#[derive(Debug)]
pub struct MetricsRegistry {
    total_dispatched: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
    retries_scheduled: AtomicU64,
    actions: StdRwLock<HashMap<String, Arc<ActionStats>>>,
    nodes: StdRwLock<HashMap<u64, Arc<NodeStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            total_dispatched: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            retries_scheduled: AtomicU64::new(0),
            actions: StdRwLock::new(HashMap::new()),
            nodes: StdRwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn increment_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_in_flight(&self) {
        // Saturate so an unmatched decrement cannot wrap the gauge.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn increment_retries(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    fn action_entry(&self, action: &str) -> Arc<ActionStats> {
        if let Ok(actions) = self.actions.read() {
            if let Some(stats) = actions.get(action) {
                return stats.clone();
            }
        }
        let mut actions = self
            .actions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        actions
            .entry(action.to_string())
            .or_insert_with(|| Arc::new(ActionStats::new()))
            .clone()
    }

    fn node_entry(&self, node_id: u64) -> Arc<NodeStats> {
        let mut nodes = self
            .nodes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        nodes.entry(node_id).or_default().clone()
    }

    /// Records one finished agent call.
    pub fn record_dispatch(
        &self,
        action: &str,
        node_id: u64,
        latency_ms: u64,
        outcome: DispatchOutcome,
    ) {
        self.total_dispatched.fetch_add(1, Ordering::Relaxed);
        if outcome == DispatchOutcome::Success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        self.action_entry(action).record(latency_ms, outcome);
        self.node_entry(node_id).record(outcome);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let actions: BTreeMap<String, ActionMetrics> = self
            .actions
            .read()
            .map(|guard| {
                guard
                    .iter()
                    .map(|(name, stats)| (name.clone(), stats.snapshot()))
                    .collect()
            })
            .unwrap_or_default();

        let nodes: BTreeMap<u64, NodeDispatchMetrics> = self
            .nodes
            .read()
            .map(|guard| {
                guard
                    .iter()
                    .map(|(id, stats)| (*id, stats.snapshot(*id)))
                    .collect()
            })
            .unwrap_or_default();

        MetricsSnapshot {
            total_dispatched: self.total_dispatched.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            actions,
            nodes,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
