//! Metric sink
//!
//! Collection legs write gauges through [`MetricSink`]; the `/metrics`
//! endpoint renders whatever the sink holds. [`PrometheusSink`] keeps one
//! `GaugeVec` per metric name in its own registry.

use prometheus::core::Collector;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Prefix shared by every exported gauge
pub const METRIC_PREFIX: &str = "solarapiproxy";

/// Identifies which backend a write belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricScope {
    /// Metric category of the backend, e.g. `tesla_gateway`
    pub category: String,
    /// Gateway host, exported as the `<category>_host` label
    pub host: String,
}

impl MetricScope {
    pub fn new(category: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            host: host.into(),
        }
    }

    /// Fully qualified gauge name for a sub-category and metric
    pub fn metric_name(&self, sub_category: &str, metric: &str) -> String {
        sanitize(&format!(
            "{}_{}_{}_{}",
            METRIC_PREFIX, self.category, sub_category, metric
        ))
    }

    pub fn host_label(&self) -> String {
        sanitize(&format!("{}_host", self.category))
    }
}

/// Write-only destination for collected values
pub trait MetricSink: Send + Sync {
    /// Set `sub_category/metric{labels}` for the backend in `scope`
    fn set(
        &self,
        scope: &MetricScope,
        sub_category: &str,
        metric: &str,
        labels: &[(&str, &str)],
        value: f64,
    );

    /// Stop publishing one labelled series
    fn remove(&self, scope: &MetricScope, sub_category: &str, metric: &str, labels: &[(&str, &str)]);
}

/// Replace characters outside the Prometheus name charset with `_`
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

// ============================================================================
// Prometheus sink
// ============================================================================

/// [`MetricSink`] backed by a dedicated Prometheus registry
#[derive(Debug)]
pub struct PrometheusSink {
    registry: Registry,
    gauges: Mutex<HashMap<String, GaugeVec>>,
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Content type matching [`PrometheusSink::encode`]
    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    fn gauge_vec(&self, name: &str, help: &str, label_keys: &[String]) -> Option<GaugeVec> {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = gauges.get(name) {
            let same_labels = existing
                .desc()
                .first()
                .map(|desc| desc.variable_labels == label_keys)
                .unwrap_or(false);
            if same_labels {
                return Some(existing.clone());
            }
            tracing::warn!(
                metric = %name,
                labels = ?label_keys,
                "Metric already registered with different labels, skipping write"
            );
            return None;
        }

        let keys: Vec<&str> = label_keys.iter().map(String::as_str).collect();
        let created = GaugeVec::new(Opts::new(name, help), &keys).and_then(|vec| {
            self.registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        });

        match created {
            Ok(vec) => {
                gauges.insert(name.to_string(), vec.clone());
                Some(vec)
            }
            Err(e) => {
                tracing::warn!(metric = %name, error = %e, "Failed to register gauge");
                None
            }
        }
    }

    fn series(
        &self,
        scope: &MetricScope,
        sub_category: &str,
        metric: &str,
        labels: &[(&str, &str)],
    ) -> Option<(GaugeVec, Vec<String>)> {
        let name = scope.metric_name(sub_category, metric);

        let mut keys: Vec<String> = labels.iter().map(|(k, _)| sanitize(k)).collect();
        keys.push(scope.host_label());
        let mut values: Vec<String> = labels.iter().map(|(_, v)| v.to_string()).collect();
        values.push(scope.host.clone());

        self.gauge_vec(&name, metric, &keys).map(|vec| (vec, values))
    }
}

impl MetricSink for PrometheusSink {
    fn set(
        &self,
        scope: &MetricScope,
        sub_category: &str,
        metric: &str,
        labels: &[(&str, &str)],
        value: f64,
    ) {
        if let Some((vec, values)) = self.series(scope, sub_category, metric, labels) {
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            vec.with_label_values(&values).set(value);
        }
    }

    fn remove(&self, scope: &MetricScope, sub_category: &str, metric: &str, labels: &[(&str, &str)]) {
        if let Some((vec, values)) = self.series(scope, sub_category, metric, labels) {
            let values: Vec<&str> = values.iter().map(String::as_str).collect();
            // Removing a series that was never set is not an error here
            let _ = vec.remove_label_values(&values);
        }
    }
}

// ============================================================================
// Recording sink for tests
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> MetricScope {
        MetricScope::new("tesla_gateway", "192.168.1.20")
    }

    #[test]
    fn test_metric_name_is_sanitized() {
        let scope = scope();
        assert_eq!(
            scope.metric_name("site", "instant-power.kw"),
            "solarapiproxy_tesla_gateway_site_instant_power_kw"
        );
        assert_eq!(scope.host_label(), "tesla_gateway_host");
    }

    #[test]
    fn test_set_and_encode() {
        let sink = PrometheusSink::new();
        sink.set(&scope(), "powerwall", "percentage", &[], 87.5);

        let text = sink.encode().unwrap();
        assert!(text.contains(
            "solarapiproxy_tesla_gateway_powerwall_percentage{tesla_gateway_host=\"192.168.1.20\"} 87.5"
        ));
    }

    #[test]
    fn test_remove_unpublishes_series() {
        let sink = PrometheusSink::new();
        sink.set(&scope(), "request", "duration_ms", &[("login_cached", "true")], 12.0);
        sink.set(&scope(), "request", "duration_ms", &[("login_cached", "false")], 40.0);
        sink.remove(&scope(), "request", "duration_ms", &[("login_cached", "false")]);

        let text = sink.encode().unwrap();
        assert!(text.contains("login_cached=\"true\""));
        assert!(!text.contains("login_cached=\"false\""));
    }

    #[test]
    fn test_conflicting_labels_are_skipped() {
        let sink = PrometheusSink::new();
        sink.set(&scope(), "operation", "mode", &[("mode", "backup")], 1.0);
        // Same name without the mode label must not panic or replace the series
        sink.set(&scope(), "operation", "mode", &[], 3.0);

        let text = sink.encode().unwrap();
        assert!(text.contains("mode=\"backup\""));
        assert!(!text.contains("} 3"));
    }
}
