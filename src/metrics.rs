use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub outcome: RouteOutcome,
}

/// How a gateway request was classified.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum RouteOutcome {
    Passthrough,
    Unresolvable,
    Hit,
    Miss,
    Populating,
    Indeterminate,
}

impl RouteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Unresolvable => "unresolvable",
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Populating => "populating",
            Self::Indeterminate => "indeterminate",
        }
    }
}

impl EncodeLabelValue for RouteOutcome {
    fn encode(&self, encoder: &mut LabelValueEncoder<'_>) -> Result<(), std::fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PopulateLabels {
    pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamLabels {
    pub upstream: UpstreamKind,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum UpstreamKind {
    Internal,
    Origin,
}

impl UpstreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Origin => "origin",
        }
    }
}

impl EncodeLabelValue for UpstreamKind {
    fn encode(&self, encoder: &mut LabelValueEncoder<'_>) -> Result<(), std::fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- routing --
    pub route_decisions_total: Family<RouteLabels, Counter>,
    pub forward_errors_total: Family<UpstreamLabels, Counter>,

    // -- populate --
    pub populate_total: Family<PopulateLabels, Counter>,
    pub populate_bytes: Counter,
    pub populate_duration_seconds: Histogram,
    pub populates_in_flight: Gauge,

    // -- cache --
    pub cache_size_bytes: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let route_decisions_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "tarcache_route_decisions",
            "Gateway routing decisions by outcome",
            route_decisions_total.clone(),
        );

        let forward_errors_total = Family::<UpstreamLabels, Counter>::default();
        registry.register(
            "tarcache_forward_errors",
            "Requests that could not be forwarded, by upstream",
            forward_errors_total.clone(),
        );

        let populate_total = Family::<PopulateLabels, Counter>::default();
        registry.register(
            "tarcache_populate",
            "Finished populate attempts by result",
            populate_total.clone(),
        );

        let populate_bytes = Counter::default();
        registry.register(
            "tarcache_populate_bytes",
            "Bytes written to the cache by populate tasks",
            populate_bytes.clone(),
        );

        let populate_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 14));
        registry.register(
            "tarcache_populate_duration_seconds",
            "Populate latency in seconds",
            populate_duration_seconds.clone(),
        );

        let populates_in_flight: Gauge = Gauge::default();
        registry.register(
            "tarcache_populates_in_flight",
            "Populate tasks currently queued or running",
            populates_in_flight.clone(),
        );

        let cache_size_bytes: Gauge = Gauge::default();
        registry.register(
            "tarcache_cache_size_bytes",
            "Local cache disk usage in bytes at the last health check",
            cache_size_bytes.clone(),
        );

        Self {
            route_decisions_total,
            forward_errors_total,
            populate_total,
            populate_bytes,
            populate_duration_seconds,
            populates_in_flight,
            cache_size_bytes,
        }
    }

    pub fn record_route(&self, outcome: RouteOutcome) {
        self.route_decisions_total
            .get_or_create(&RouteLabels { outcome })
            .inc();
    }

    pub fn record_populate(&self, result: &str) {
        self.populate_total
            .get_or_create(&PopulateLabels {
                result: result.to_string(),
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_recorded_values() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_route(RouteOutcome::Hit);
        registry.metrics.record_route(RouteOutcome::Hit);
        registry.metrics.record_populate("stored");
        registry.metrics.populate_bytes.inc_by(512);

        let text = registry.encode().unwrap();
        assert!(text.contains("tarcache_route_decisions_total{outcome=\"hit\"} 2"));
        assert!(text.contains("tarcache_populate_total{result=\"stored\"} 1"));
        assert!(text.contains("tarcache_populate_bytes_total 512"));
    }

    #[test]
    fn label_values_are_snake_case() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_route(RouteOutcome::Indeterminate);
        registry
            .metrics
            .forward_errors_total
            .get_or_create(&UpstreamLabels {
                upstream: UpstreamKind::Origin,
            })
            .inc();

        let text = registry.encode().unwrap();
        assert!(text.contains("tarcache_route_decisions_total{outcome=\"indeterminate\"} 1"));
        assert!(text.contains("tarcache_forward_errors_total{upstream=\"origin\"} 1"));
        assert!(!text.contains("Indeterminate"));
    }
}
