//! Prometheus instrumentation (feature `metrics`).
//!
//! Everything registers under a `pyrun` sub-registry, so the exposed names are
//! `pyrun_executions_total`, `pyrun_failures_total`,
//! `pyrun_execution_duration_seconds` and `pyrun_executions_in_flight`.

use std::sync::atomic::AtomicI64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Strategy the execution ran under: `isolated`, `direct`, or `none` when it
/// was refused before detection.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StrategyLabel {
    /// Strategy label.
    pub strategy: String,
}

/// A [`SandboxError::kind`](crate::SandboxError::kind) value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorKindLabel {
    /// Error kind label.
    pub kind: String,
}

/// Counters, a latency histogram and an in-flight gauge for the executor.
pub struct SandboxMetrics {
    /// Finished executions, successful or not.
    pub executions: Family<StrategyLabel, Counter>,
    /// Failed executions, rejections included.
    pub failures: Family<ErrorKindLabel, Counter>,
    /// Wall time from submission to result.
    pub duration: Family<StrategyLabel, Histogram>,
    /// Executions past admission and not yet finished.
    pub in_flight: Gauge<i64, AtomicI64>,
}

impl SandboxMetrics {
    /// Register every metric with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let registry = registry.sub_registry_with_prefix("pyrun");

        let executions = Family::<StrategyLabel, Counter>::default();
        let failures = Family::<ErrorKindLabel, Counter>::default();
        // 50 ms doubling up to ~25 s covers two full default stage budgets.
        let duration = Family::<StrategyLabel, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.05, 2.0, 10))
        });
        let in_flight = Gauge::<i64, AtomicI64>::default();

        registry.register("executions", "Finished script executions", executions.clone());
        registry.register("failures", "Failed executions by error kind", failures.clone());
        registry.register(
            "execution_duration_seconds",
            "Submission-to-result latency",
            duration.clone(),
        );
        registry.register(
            "executions_in_flight",
            "Executions currently holding a slot",
            in_flight.clone(),
        );

        Self {
            executions,
            failures,
            duration,
            in_flight,
        }
    }

    /// Count a finished execution and observe its latency.
    pub fn record_execution(&self, strategy: &str, duration_secs: f64) {
        let label = StrategyLabel {
            strategy: strategy.to_owned(),
        };
        self.executions.get_or_create(&label).inc();
        self.duration.get_or_create(&label).observe(duration_secs);
    }

    /// Count a failure.
    pub fn record_error(&self, kind: &str) {
        self.failures
            .get_or_create(&ErrorKindLabel {
                kind: kind.to_owned(),
            })
            .inc();
    }

    /// Raise the in-flight gauge until the returned guard drops.
    pub fn track_in_flight(&self) -> InFlight<'_> {
        self.in_flight.inc();
        InFlight(self)
    }
}

/// Lowers [`SandboxMetrics::in_flight`] on drop.
pub struct InFlight<'a>(&'a SandboxMetrics);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.dec();
    }
}
