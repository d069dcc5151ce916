//! Bounded in-memory history of metric samples and fired alerts.

use crate::alert::{Alert, AlertLevel};
use crate::metrics::MetricSnapshot;
use latchkey_core::{MonitorConfig, Timestamp};
use std::collections::VecDeque;
use std::time::Duration;

/// Samples and alerts, oldest first.
///
/// Entries older than `retention` are dropped by [`History::prune`]; each
/// queue is also capped at `max_history` entries on insert.
#[derive(Debug, Clone)]
pub struct History {
    samples: VecDeque<MetricSnapshot>,
    alerts: VecDeque<Alert>,
    retention: Duration,
    max_history: usize,
}

impl History {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            samples: VecDeque::new(),
            alerts: VecDeque::new(),
            retention: config.retention,
            max_history: config.max_history.max(1),
        }
    }

    pub fn record_metrics(&mut self, snapshot: MetricSnapshot) {
        self.samples.push_back(snapshot);
        while self.samples.len() > self.max_history {
            self.samples.pop_front();
        }
    }

    pub fn record_alert(&mut self, alert: Alert) {
        self.alerts.push_back(alert);
        while self.alerts.len() > self.max_history {
            self.alerts.pop_front();
        }
    }

    /// Drop everything taken before `now - retention`.
    pub fn prune(&mut self, now: Timestamp) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let cutoff = now - retention;
        while self.samples.front().is_some_and(|s| s.taken_at < cutoff) {
            self.samples.pop_front();
        }
        while self.alerts.front().is_some_and(|a| a.triggered_at < cutoff) {
            self.alerts.pop_front();
        }
    }

    /// Samples with `from <= taken_at <= to`; an open bound is unbounded.
    pub fn metrics_between(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> Vec<MetricSnapshot> {
        self.samples
            .iter()
            .filter(|s| in_range(s.taken_at, from, to))
            .cloned()
            .collect()
    }

    /// Alerts at exactly `level`, or all alerts.
    pub fn alerts(&self, level: Option<AlertLevel>) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| level.map_or(true, |l| a.level == l))
            .cloned()
            .collect()
    }

    pub fn alerts_between(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| in_range(a.triggered_at, from, to))
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<&MetricSnapshot> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn in_range(at: Timestamp, from: Option<Timestamp>, to: Option<Timestamp>) -> bool {
    from.map_or(true, |f| at >= f) && to.map_or(true, |t| at <= t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertRule;
    use chrono::{TimeZone, Utc};

    fn config(retention_secs: u64, max_history: usize) -> MonitorConfig {
        MonitorConfig {
            retention: Duration::from_secs(retention_secs),
            max_history,
            ..MonitorConfig::default()
        }
    }

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_max_history_caps_samples() {
        let mut history = History::new(&config(3600, 3));
        for i in 0..5 {
            history.record_metrics(MetricSnapshot::at(at(i)).with("n", i as f64));
        }
        assert_eq!(history.len(), 3);
        let kept: Vec<f64> = history
            .metrics_between(None, None)
            .iter()
            .filter_map(|s| s.get("n"))
            .collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
        assert_eq!(history.latest().and_then(|s| s.get("n")), Some(4.0));
    }

    #[test]
    fn test_prune_by_retention() {
        let mut history = History::new(&config(60, 100));
        history.record_metrics(MetricSnapshot::at(at(0)));
        history.record_metrics(MetricSnapshot::at(at(50)));
        history.record_metrics(MetricSnapshot::at(at(90)));
        history.prune(at(100));
        assert_eq!(history.len(), 2);
        assert_eq!(history.metrics_between(Some(at(60)), None).len(), 1);
        assert_eq!(history.metrics_between(None, Some(at(50))).len(), 1);
    }

    #[test]
    fn test_alerts_filtered_by_level() {
        let mut history = History::new(&config(3600, 100));
        let snapshot = MetricSnapshot::new();
        history.record_alert(Alert::new(&AlertRule::new("a", "a", |_| true), &snapshot));
        history.record_alert(Alert::new(
            &AlertRule::new("b", "b", |_| true).with_level(AlertLevel::Critical),
            &snapshot,
        ));
        assert_eq!(history.alerts(None).len(), 2);
        let critical = history.alerts(Some(AlertLevel::Critical));
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].rule, "b");
    }
}
