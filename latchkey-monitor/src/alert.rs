//! Alerts and the rules that raise them.

use crate::metrics::MetricSnapshot;
use chrono::Utc;
use latchkey_core::{new_alert_id, AlertId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// ALERT LEVEL ENUM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ALERT
// ============================================================================

/// A fired rule together with the readings that fired it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub rule: String,
    pub level: AlertLevel,
    pub message: String,
    pub triggered_at: Timestamp,
    pub metrics: BTreeMap<String, f64>,
}

impl Alert {
    pub fn new(rule: &AlertRule, snapshot: &MetricSnapshot) -> Self {
        Self {
            id: new_alert_id(),
            rule: rule.name.clone(),
            level: rule.level,
            message: rule.message.clone(),
            triggered_at: Utc::now(),
            metrics: snapshot.values.clone(),
        }
    }
}

// ============================================================================
// RULES
// ============================================================================

pub type AlertPredicate = Arc<dyn Fn(&MetricSnapshot) -> bool + Send + Sync>;

/// Predicate over a metric snapshot plus the alert it raises.
///
/// A rule that fired stays silent for its cooldown even if the predicate
/// keeps matching. Rules without their own cooldown use the monitor default.
#[derive(Clone)]
pub struct AlertRule {
    pub name: String,
    pub level: AlertLevel,
    pub message: String,
    pub cooldown: Option<Duration>,
    predicate: AlertPredicate,
}

impl fmt::Debug for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertRule")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("message", &self.message)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl AlertRule {
    pub fn new<F>(name: impl Into<String>, message: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&MetricSnapshot) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            level: AlertLevel::Warning,
            message: message.into(),
            cooldown: None,
            predicate: Arc::new(predicate),
        }
    }

    /// Fires when `metric` is present and strictly greater than `limit`.
    pub fn threshold_above(name: impl Into<String>, metric: impl Into<String>, limit: f64) -> Self {
        let metric = metric.into();
        let message = format!("{metric} above {limit}");
        Self::new(name, message, move |s: &MetricSnapshot| {
            s.get(&metric).is_some_and(|v| v > limit)
        })
    }

    /// Fires when `metric` is present and strictly less than `limit`.
    pub fn threshold_below(name: impl Into<String>, metric: impl Into<String>, limit: f64) -> Self {
        let metric = metric.into();
        let message = format!("{metric} below {limit}");
        Self::new(name, message, move |s: &MetricSnapshot| {
            s.get(&metric).is_some_and(|v| v < limit)
        })
    }

    pub fn with_level(mut self, level: AlertLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub fn matches(&self, snapshot: &MetricSnapshot) -> bool {
        (self.predicate)(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        let snapshot = MetricSnapshot::new().with("cache.hit_ratio", 0.4);
        assert!(AlertRule::threshold_below("low", "cache.hit_ratio", 0.5).matches(&snapshot));
        assert!(!AlertRule::threshold_above("high", "cache.hit_ratio", 0.5).matches(&snapshot));
        // absent metric never fires
        assert!(!AlertRule::threshold_above("x", "local.evictions", 0.0).matches(&snapshot));
    }

    #[test]
    fn test_alert_captures_rule_and_metrics() {
        let rule = AlertRule::threshold_above("evictions", "local.evictions", 10.0)
            .with_level(AlertLevel::Critical)
            .with_message("Local store is thrashing");
        let snapshot = MetricSnapshot::new().with("local.evictions", 50.0);
        let alert = Alert::new(&rule, &snapshot);
        assert_eq!(alert.rule, "evictions");
        assert_eq!(alert.level, AlertLevel::Critical);
        assert_eq!(alert.message, "Local store is thrashing");
        assert_eq!(alert.metrics.get("local.evictions"), Some(&50.0));
    }

    #[test]
    fn test_level_ordering_and_serde() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        let json = serde_json::to_string(&AlertLevel::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
    }
}
