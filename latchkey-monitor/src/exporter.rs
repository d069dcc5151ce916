//! Prometheus text exposition of the latest snapshot.

use crate::metrics::MetricSnapshot;
use latchkey_core::{CacheError, LatchkeyResult, MonitorError};
use prometheus::{Encoder, Gauge, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::Mutex;

const METRIC_PREFIX: &str = "latchkey_";

/// One gauge per metric name, registered on first sight in a private registry.
pub struct PrometheusExporter {
    registry: Registry,
    gauges: Mutex<HashMap<String, Gauge>>,
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

fn export_failed(reason: impl Into<String>) -> MonitorError {
    MonitorError::SinkFailed {
        sink: "prometheus".to_string(),
        reason: reason.into(),
    }
}

/// `cache.hit_ratio` becomes `latchkey_cache_hit_ratio`.
pub fn metric_name(name: &str) -> String {
    let mut out = String::with_capacity(METRIC_PREFIX.len() + name.len());
    out.push_str(METRIC_PREFIX);
    out.extend(
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }),
    );
    out
}

impl PrometheusExporter {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Set every gauge to the snapshot's value.
    pub fn export(&self, snapshot: &MetricSnapshot) -> LatchkeyResult<()> {
        let mut gauges = self
            .gauges
            .lock()
            .map_err(|_| CacheError::LockPoisoned)?;
        for (name, value) in snapshot.iter() {
            let metric = metric_name(name);
            let gauge = match gauges.get(&metric) {
                Some(gauge) => gauge.clone(),
                None => {
                    let gauge = Gauge::new(metric.clone(), format!("latchkey metric {name}"))
                        .map_err(|e| export_failed(e.to_string()))?;
                    self.registry
                        .register(Box::new(gauge.clone()))
                        .map_err(|e| export_failed(e.to_string()))?;
                    gauges.insert(metric, gauge.clone());
                    gauge
                }
            };
            gauge.set(value);
        }
        Ok(())
    }

    /// Registry contents in the text exposition format.
    pub fn render(&self) -> LatchkeyResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| export_failed(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| export_failed(e.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_sanitized() {
        assert_eq!(metric_name("cache.hit_ratio"), "latchkey_cache_hit_ratio");
        assert_eq!(metric_name("remote.ping-ms"), "latchkey_remote_ping_ms");
    }

    #[test]
    fn test_export_and_render() {
        let exporter = PrometheusExporter::new();
        exporter
            .export(&MetricSnapshot::new().with("local.hits", 3.0))
            .unwrap();
        exporter
            .export(&MetricSnapshot::new().with("local.hits", 7.0).with("local.misses", 1.0))
            .unwrap();

        let text = exporter.render().unwrap();
        assert!(text.contains("latchkey_local_hits 7"));
        assert!(text.contains("latchkey_local_misses 1"));
        assert_eq!(exporter.registry().gather().len(), 2);
    }

    #[test]
    fn test_exporters_do_not_share_registry() {
        let a = PrometheusExporter::new();
        let b = PrometheusExporter::new();
        a.export(&MetricSnapshot::new().with("x", 1.0)).unwrap();
        b.export(&MetricSnapshot::new().with("x", 2.0)).unwrap();
        assert!(a.render().unwrap().contains("latchkey_x 1"));
        assert!(b.render().unwrap().contains("latchkey_x 2"));
    }
}
