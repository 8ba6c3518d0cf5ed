//! Minimal metrics emission helpers.
//!
//! These helpers emit structured metrics via tracing by default. A test sink can
//! be installed to capture emissions in unit tests.

use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
    pub labels: Vec<MetricLabel>,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        let (kind, value) = match event.value {
            MetricValue::Counter(value) => ("counter", value),
            MetricValue::Gauge(value) => ("gauge", value),
            MetricValue::Histogram(value) => ("histogram", value),
        };
        tracing::debug!(
            target: "metrics",
            metric = event.name,
            kind,
            value,
            labels = ?event.labels
        );
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> =
    std::sync::OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = sink;
}

fn emit(name: &'static str, value: MetricValue, labels: Vec<MetricLabel>) {
    sink().record(MetricEvent {
        name,
        value,
        labels,
    });
}

fn label(key: &'static str, value: impl Into<String>) -> Vec<MetricLabel> {
    vec![MetricLabel {
        key,
        value: value.into(),
    }]
}

fn duration_ms(duration: Duration) -> u64 {
    let ms = duration.as_millis();
    u64::try_from(ms).unwrap_or(u64::MAX)
}

pub fn drc_miss(drc: &'static str) {
    emit("drc_miss", MetricValue::Counter(1), label("drc", drc));
}

pub fn drc_replay(drc: &'static str) {
    emit("drc_replay", MetricValue::Counter(1), label("drc", drc));
}

pub fn drc_in_progress(drc: &'static str) {
    emit("drc_in_progress", MetricValue::Counter(1), label("drc", drc));
}

pub fn drc_dup_dropped(drc: &'static str) {
    emit("drc_dup_dropped", MetricValue::Counter(1), label("drc", drc));
}

pub fn drc_insert_failed(drc: &'static str) {
    emit("drc_insert_failed", MetricValue::Counter(1), label("drc", drc));
}

pub fn drc_retired(drc: &'static str, count: usize) {
    emit(
        "drc_retired",
        MetricValue::Counter(count as u64),
        label("drc", drc),
    );
}

pub fn set_drc_size(drc: &'static str, size: usize) {
    emit("drc_size", MetricValue::Gauge(size as u64), label("drc", drc));
}

pub fn set_fridge_threads(pool: &str, threads: usize) {
    emit(
        "fridge_threads",
        MetricValue::Gauge(threads as u64),
        label("pool", pool),
    );
}

pub fn set_fridge_deferred(pool: &str, deferred: usize) {
    emit(
        "fridge_deferred",
        MetricValue::Gauge(deferred as u64),
        label("pool", pool),
    );
}

pub fn fridge_spawn_failed(pool: &str) {
    emit(
        "fridge_spawn_failed",
        MetricValue::Counter(1),
        label("pool", pool),
    );
}

pub fn grace_entered() {
    emit("grace_entered", MetricValue::Counter(1), Vec::new());
}

pub fn grace_lifted(duration: Duration) {
    emit("grace_lifted", MetricValue::Counter(1), Vec::new());
    emit(
        "grace_duration",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn grace_rejected() {
    emit("grace_rejected", MetricValue::Counter(1), Vec::new());
}

pub fn lease_expired() {
    emit("lease_expired", MetricValue::Counter(1), Vec::new());
}

pub fn client_created() {
    emit("client_created", MetricValue::Counter(1), Vec::new());
}

pub fn rdma_backpressure_wait(duration: Duration) {
    emit(
        "rdma_backpressure_wait",
        MetricValue::Histogram(duration_ms(duration)),
        Vec::new(),
    );
}

pub fn request_executed(protocol: &'static str, duration: Duration) {
    emit(
        "request_executed",
        MetricValue::Counter(1),
        label("protocol", protocol),
    );
    emit(
        "request_duration",
        MetricValue::Histogram(duration_ms(duration)),
        label("protocol", protocol),
    );
}

pub fn set_connections(value: usize) {
    emit("connections", MetricValue::Gauge(value as u64), Vec::new());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSink {
        events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricSink for TestSink {
        fn record(&self, event: MetricEvent) {
            self.events.lock().expect("metrics lock").push(event);
        }
    }

    #[test]
    fn emits_counters_gauges_and_histograms() {
        let sink = Arc::new(TestSink::default());
        set_sink(sink.clone());

        drc_miss("tcp");
        set_drc_size("udp", 12);
        grace_lifted(Duration::from_millis(40));

        let events = sink.events.lock().expect("metrics lock");
        assert!(events.iter().any(|e| e.name == "drc_miss"
            && e.labels.iter().any(|l| l.key == "drc" && l.value == "tcp")));
        assert!(
            events
                .iter()
                .any(|e| e.name == "drc_size" && e.value == MetricValue::Gauge(12))
        );
        assert!(events.iter().any(|e| e.name == "grace_duration"));
    }
}
