//! Periodic collection and alert evaluation.
//!
//! Each tick the monitor:
//!
//! 1. Collects every source into one snapshot (`source.metric` names)
//! 2. Evaluates the rules, skipping those still cooling down
//! 3. Sends fired alerts to the sink
//! 4. Records the snapshot and alerts in history and refreshes the exporter
//!
//! A failing source or sink is logged and counted; it never stops the tick.

use crate::alert::{Alert, AlertLevel, AlertRule};
use crate::exporter::PrometheusExporter;
use crate::history::History;
use crate::metrics::{MetricSnapshot, MetricsSource};
use crate::sink::AlertSink;
use chrono::Utc;
use latchkey_core::{CacheError, LatchkeyResult, MonitorConfig, Timestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the monitor's own activity.
#[derive(Debug, Default)]
pub struct MonitorMetrics {
    pub ticks: AtomicU64,
    pub source_errors: AtomicU64,
    pub alerts_fired: AtomicU64,
    pub sink_errors: AtomicU64,
}

impl MonitorMetrics {
    pub fn snapshot(&self) -> MonitorMetricsSnapshot {
        MonitorMetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorMetricsSnapshot {
    pub ticks: u64,
    pub source_errors: u64,
    pub alerts_fired: u64,
    pub sink_errors: u64,
}

/// Outcome of one [`Monitor::tick`].
#[derive(Debug, Clone)]
pub struct TickReport {
    pub snapshot: MetricSnapshot,
    pub alerts: Vec<Alert>,
}

// ============================================================================
// MONITOR
// ============================================================================

pub struct Monitor {
    config: MonitorConfig,
    sources: Vec<Arc<dyn MetricsSource>>,
    rules: Vec<AlertRule>,
    sink: Arc<dyn AlertSink>,
    history: Mutex<History>,
    last_fired: Mutex<HashMap<String, Instant>>,
    exporter: Option<Arc<PrometheusExporter>>,
    metrics: MonitorMetrics,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sources: Vec<&str> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("Monitor")
            .field("config", &self.config)
            .field("sources", &sources)
            .field("rules", &self.rules)
            .field("sink", &self.sink.name())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    pub fn new(config: &MonitorConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config: config.clone(),
            sources: Vec::new(),
            rules: Vec::new(),
            sink,
            history: Mutex::new(History::new(config)),
            last_fired: Mutex::new(HashMap::new()),
            exporter: None,
            metrics: MonitorMetrics::default(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_rule(mut self, rule: AlertRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<PrometheusExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn metrics(&self) -> MonitorMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Snapshot of every source. A source that fails contributes only
    /// `{source}.up = 0`.
    pub async fn collect(&self) -> MetricSnapshot {
        let mut all = MetricSnapshot::new();
        for source in &self.sources {
            match source.collect().await {
                Ok(mut snapshot) => {
                    snapshot.derive_hit_ratios();
                    snapshot.insert("up", 1.0);
                    all.merge_source(source.name(), snapshot);
                }
                Err(e) => {
                    tracing::error!(source = source.name(), error = %e, "Metric collection failed");
                    self.metrics.source_errors.fetch_add(1, Ordering::Relaxed);
                    all.insert(format!("{}.up", source.name()), 0.0);
                }
            }
        }
        all
    }

    /// Rules matching `snapshot` that are not cooling down. Marks each
    /// returned rule as fired now.
    pub fn evaluate(&self, snapshot: &MetricSnapshot) -> LatchkeyResult<Vec<Alert>> {
        let mut last_fired = self
            .last_fired
            .lock()
            .map_err(|_| CacheError::LockPoisoned)?;
        let now = Instant::now();
        let mut alerts = Vec::new();

        for rule in &self.rules {
            if !rule.matches(snapshot) {
                continue;
            }
            let cooldown = rule.cooldown.unwrap_or(self.config.default_cooldown);
            if let Some(fired_at) = last_fired.get(&rule.name) {
                if now.duration_since(*fired_at) < cooldown {
                    tracing::debug!(rule = %rule.name, "Alert suppressed by cooldown");
                    continue;
                }
            }
            last_fired.insert(rule.name.clone(), now);
            alerts.push(Alert::new(rule, snapshot));
        }
        Ok(alerts)
    }

    /// One collect, evaluate and dispatch cycle.
    pub async fn tick(&self) -> LatchkeyResult<TickReport> {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.collect().await;
        let alerts = self.evaluate(&snapshot)?;

        for alert in &alerts {
            self.metrics.alerts_fired.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.sink.send(alert).await {
                tracing::error!(
                    sink = self.sink.name(),
                    alert_id = %alert.id,
                    rule = %alert.rule,
                    error = %e,
                    "Alert delivery failed"
                );
                self.metrics.sink_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let mut history = self.history.lock().map_err(|_| CacheError::LockPoisoned)?;
            history.record_metrics(snapshot.clone());
            for alert in &alerts {
                history.record_alert(alert.clone());
            }
            history.prune(Utc::now());
        }

        if let Some(exporter) = &self.exporter {
            if let Err(e) = exporter.export(&snapshot) {
                tracing::warn!(error = %e, "Prometheus export failed");
            }
        }

        Ok(TickReport { snapshot, alerts })
    }

    /// Tick every `collection_interval` until `shutdown_rx` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> MonitorMetricsSnapshot {
        let mut ticker = interval(self.config.collection_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            collection_interval_ms = self.config.collection_interval.as_millis() as u64,
            sources = self.sources.len(),
            rules = self.rules.len(),
            sink = self.sink.name(),
            "Monitor task started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Monitor task shutting down");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) if !report.alerts.is_empty() => {
                            tracing::info!(alerts = report.alerts.len(), "Monitor tick raised alerts");
                        }
                        Ok(_) => tracing::trace!("Monitor tick completed"),
                        Err(e) => tracing::error!(error = %e, "Monitor tick failed"),
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            ticks = snapshot.ticks,
            alerts_fired = snapshot.alerts_fired,
            source_errors = snapshot.source_errors,
            sink_errors = snapshot.sink_errors,
            "Monitor task completed"
        );
        snapshot
    }

    pub fn spawn(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<MonitorMetricsSnapshot> {
        tokio::spawn(Arc::clone(self).run(shutdown_rx))
    }

    // ========================================================================
    // HISTORY QUERIES
    // ========================================================================

    pub fn metrics_between(
        &self,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> LatchkeyResult<Vec<MetricSnapshot>> {
        let history = self.history.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(history.metrics_between(from, to))
    }

    pub fn alerts(&self, level: Option<AlertLevel>) -> LatchkeyResult<Vec<Alert>> {
        let history = self.history.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(history.alerts(level))
    }

    pub fn alerts_between(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> LatchkeyResult<Vec<Alert>> {
        let history = self.history.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(history.alerts_between(from, to))
    }

    pub fn latest(&self) -> LatchkeyResult<Option<MetricSnapshot>> {
        let history = self.history.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(history.latest().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use latchkey_core::MonitorError;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        alerts: Mutex<Vec<Alert>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn send(&self, alert: &Alert) -> LatchkeyResult<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            if self.fail {
                return Err(MonitorError::SinkFailed {
                    sink: "recorder".into(),
                    reason: "down".into(),
                }
                .into());
            }
            Ok(())
        }
    }

    struct FixedSource {
        name: &'static str,
        value: Mutex<Option<f64>>,
    }

    impl FixedSource {
        fn new(name: &'static str, value: f64) -> Arc<Self> {
            Arc::new(Self {
                name,
                value: Mutex::new(Some(value)),
            })
        }

        fn set(&self, value: Option<f64>) {
            *self.value.lock().unwrap() = value;
        }
    }

    #[async_trait]
    impl MetricsSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn collect(&self) -> LatchkeyResult<MetricSnapshot> {
            match *self.value.lock().unwrap() {
                Some(v) => Ok(MetricSnapshot::new().with("value", v)),
                None => Err(MonitorError::SourceFailed {
                    source_name: self.name.into(),
                    reason: "offline".into(),
                }
                .into()),
            }
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            collection_interval: Duration::from_secs(1),
            default_cooldown: Duration::from_secs(60),
            ..MonitorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_repeat_alerts() {
        let sink = Arc::new(Recorder::default());
        let gauge = FixedSource::new("queue", 50.0);
        let monitor = Monitor::new(&config(), sink.clone())
            .with_source(gauge.clone())
            .with_rule(AlertRule::threshold_above("deep_queue", "queue.value", 10.0));

        assert_eq!(monitor.tick().await.unwrap().alerts.len(), 1);
        assert_eq!(monitor.tick().await.unwrap().alerts.len(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(monitor.tick().await.unwrap().alerts.len(), 1);
        assert_eq!(sink.alerts.lock().unwrap().len(), 2);
        assert_eq!(monitor.metrics().alerts_fired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_cooldown_overrides_default() {
        let sink = Arc::new(Recorder::default());
        let monitor = Monitor::new(&config(), sink.clone())
            .with_source(FixedSource::new("queue", 50.0))
            .with_rule(
                AlertRule::threshold_above("deep_queue", "queue.value", 10.0)
                    .with_cooldown(Duration::from_secs(5)),
            );

        monitor.tick().await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        monitor.tick().await.unwrap();
        assert_eq!(sink.alerts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_source_is_isolated() {
        let healthy = FixedSource::new("healthy", 1.0);
        let broken = FixedSource::new("broken", 1.0);
        broken.set(None);
        let monitor = Monitor::new(&config(), Arc::new(Recorder::default()))
            .with_source(healthy)
            .with_source(broken);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.snapshot.get("healthy.value"), Some(1.0));
        assert_eq!(report.snapshot.get("healthy.up"), Some(1.0));
        assert_eq!(report.snapshot.get("broken.up"), Some(0.0));
        assert_eq!(report.snapshot.get("broken.value"), None);
        assert_eq!(monitor.metrics().source_errors, 1);
    }

    #[tokio::test]
    async fn test_sink_failure_still_recorded() {
        let sink = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let exporter = Arc::new(PrometheusExporter::new());
        let monitor = Monitor::new(&config(), sink)
            .with_source(FixedSource::new("queue", 50.0))
            .with_rule(AlertRule::threshold_above("deep_queue", "queue.value", 10.0))
            .with_exporter(exporter.clone());

        monitor.tick().await.unwrap();
        assert_eq!(monitor.metrics().sink_errors, 1);
        assert_eq!(monitor.alerts(None).unwrap().len(), 1);
        assert_eq!(monitor.latest().unwrap().and_then(|s| s.get("queue.value")), Some(50.0));
        assert!(exporter.render().unwrap().contains("latchkey_queue_value 50"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let monitor = Arc::new(
            Monitor::new(&config(), Arc::new(Recorder::default())).with_source(FixedSource::new("queue", 1.0)),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown_tx.send(true).unwrap();
        let metrics = handle.await.unwrap();

        assert!(metrics.ticks >= 3);
        assert_eq!(monitor.metrics_between(None, None).unwrap().len() as u64, metrics.ticks);
    }
}
