//! Prometheus metrics using the prometheus-client crate.
//!
//! Exported on the admin port's `/metrics` endpoint in OpenMetrics text
//! format. Every metric carries the `mockgate_` prefix.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use super::cardinality::CardinalityLimiter;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CallLabels {
    /// Full method path, cardinality-limited
    pub method: String,
    /// "mocked_metadata", "mocked_body", "proxied" or "error"
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReloadLabels {
    /// "success" or "failure"
    pub result: String,
}

/// Call duration buckets in milliseconds.
const CALL_DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0,
];

/// Distinct method labels kept before folding into `__other__`.
const MAX_METHOD_LABELS: usize = 500;

/// Counters are registered without the `_total` suffix; the encoder adds it.
pub struct MockGateMetrics {
    pub calls_total: Family<CallLabels, Counter>,
    pub call_duration_ms: Family<OutcomeLabels, Histogram>,
    pub reloads_total: Family<ReloadLabels, Counter>,
    pub snapshot_methods: Gauge,
    pub snapshot_cases: Gauge,
    pub snapshot_version: Gauge,
    pub connections_active: Gauge,
    method_limiter: CardinalityLimiter,
}

impl MockGateMetrics {
    /// Create and register every metric with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let calls_total = Family::<CallLabels, Counter>::default();
        registry.register(
            "mockgate_calls",
            "Proxied calls by method and outcome",
            calls_total.clone(),
        );

        let call_duration_ms = Family::<OutcomeLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(CALL_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "mockgate_call_duration_ms",
            "Time from call arrival to response headers in milliseconds",
            call_duration_ms.clone(),
        );

        let reloads_total = Family::<ReloadLabels, Counter>::default();
        registry.register(
            "mockgate_reloads",
            "Snapshot rebuild attempts by result",
            reloads_total.clone(),
        );

        let snapshot_methods = Gauge::default();
        registry.register(
            "mockgate_snapshot_methods",
            "Routed methods in the published snapshot",
            snapshot_methods.clone(),
        );

        let snapshot_cases = Gauge::default();
        registry.register(
            "mockgate_snapshot_cases",
            "Cases in the published snapshot",
            snapshot_cases.clone(),
        );

        let snapshot_version = Gauge::default();
        registry.register(
            "mockgate_snapshot_version",
            "Version of the published snapshot",
            snapshot_version.clone(),
        );

        let connections_active = Gauge::default();
        registry.register(
            "mockgate_connections_active",
            "Open inbound connections",
            connections_active.clone(),
        );

        Self {
            calls_total,
            call_duration_ms,
            reloads_total,
            snapshot_methods,
            snapshot_cases,
            snapshot_version,
            connections_active,
            method_limiter: CardinalityLimiter::new(MAX_METHOD_LABELS),
        }
    }

    pub fn record_call(&self, method: &str, outcome: &str, duration_ms: f64) {
        self.calls_total
            .get_or_create(&CallLabels {
                method: self.method_limiter.resolve(method).to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
        self.call_duration_ms
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .observe(duration_ms);
    }

    pub fn record_reload(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.reloads_total
            .get_or_create(&ReloadLabels {
                result: result.to_string(),
            })
            .inc();
    }

    pub fn record_snapshot(&self, version: u64, methods: usize, cases: usize) {
        self.snapshot_version.set(version as i64);
        self.snapshot_methods.set(methods as i64);
        self.snapshot_cases.set(cases as i64);
    }
}
