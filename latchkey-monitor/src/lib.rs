//! Latchkey Monitor - Metrics and Alerting
//!
//! Collects metrics from the cache tiers, the warmer and the remote store,
//! evaluates alert rules against them and delivers alerts to pluggable sinks.
//!
//! ```ignore
//! let monitor = Arc::new(
//!     Monitor::new(&config.monitor, Arc::new(LogSink))
//!         .with_source(local.clone())
//!         .with_rule(AlertRule::threshold_below("cold_cache", "cache.hit_ratio", 0.5)),
//! );
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = monitor.spawn(shutdown_rx);
//! ```

pub mod alert;
pub mod exporter;
pub mod history;
pub mod metrics;
pub mod monitor;
pub mod sink;

pub use alert::{Alert, AlertLevel, AlertPredicate, AlertRule};
pub use exporter::{metric_name, PrometheusExporter};
pub use history::History;
pub use metrics::{MetricSnapshot, MetricsSource, RemoteProbe};
pub use monitor::{Monitor, MonitorMetrics, MonitorMetricsSnapshot, TickReport};
pub use sink::{sign_payload, AlertSink, CompositeSink, EmailSink, LogSink, Mailer, WebhookSink};
