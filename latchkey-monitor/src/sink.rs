//! Alert delivery.
//!
//! - [`LogSink`]: structured log line at a level matching the alert
//! - [`WebhookSink`]: signed JSON POST
//! - [`EmailSink`]: hands a rendered message to a [`Mailer`]
//! - [`CompositeSink`]: fan-out where one failing sink does not stop the rest

use crate::alert::{Alert, AlertLevel};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use latchkey_core::{ConfigError, LatchkeyResult, MonitorError};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

/// Destination for fired alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> LatchkeyResult<()>;
}

fn sink_failed(sink: &str, reason: impl Into<String>) -> MonitorError {
    MonitorError::SinkFailed {
        sink: sink.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// LOG
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> LatchkeyResult<()> {
        match alert.level {
            AlertLevel::Info => {
                tracing::info!(alert_id = %alert.id, rule = %alert.rule, "{}", alert.message)
            }
            AlertLevel::Warning => {
                tracing::warn!(alert_id = %alert.id, rule = %alert.rule, "{}", alert.message)
            }
            AlertLevel::Critical => {
                tracing::error!(alert_id = %alert.id, rule = %alert.rule, "{}", alert.message)
            }
        }
        Ok(())
    }
}

// ============================================================================
// WEBHOOK
// ============================================================================

/// HMAC-SHA256 of `payload` under `secret`, hex encoded.
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String, MonitorError> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| sink_failed("webhook", format!("Failed to initialize HMAC: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Posts each alert as JSON. With a secret configured the body is signed
/// and the signature sent as `X-Latchkey-Signature: sha256=<hex>`.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: reqwest::Url,
    secret: Option<String>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl WebhookSink {
    pub fn new(url: &str) -> LatchkeyResult<Self> {
        let url = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidValue {
            field: "webhook.url".to_string(),
            value: url.to_string(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| sink_failed("webhook", format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url,
            secret: None,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Attempts per alert; the delay doubles after each failure.
    pub fn with_retries(mut self, max_attempts: u32, initial_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = initial_delay;
        self
    }

    async fn post_once(&self, alert: &Alert, body: &[u8], signature: Option<&str>) -> Result<(), String> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .header("X-Latchkey-Alert-ID", alert.id.to_string())
            .header("X-Latchkey-Alert-Level", alert.level.as_str())
            .header("User-Agent", "Latchkey-Monitor/1.0")
            .body(body.to_vec());
        if let Some(signature) = signature {
            request = request.header("X-Latchkey-Signature", format!("sha256={}", signature));
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("non-2xx status {}", response.status()))
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> LatchkeyResult<()> {
        let body = serde_json::to_vec(alert)?;
        let signature = match &self.secret {
            Some(secret) => Some(sign_payload(&body, secret)?),
            None => None,
        };

        let mut delay = self.retry_delay;
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.post_once(alert, &body, signature.as_deref()).await {
                Ok(()) => {
                    tracing::debug!(alert_id = %alert.id, url = %self.url, "Alert webhook delivered");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        alert_id = %alert.id,
                        url = %self.url,
                        attempt,
                        error = %e,
                        "Alert webhook delivery failed"
                    );
                    last_error = e;
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(sink_failed("webhook", last_error).into())
    }
}

// ============================================================================
// EMAIL
// ============================================================================

/// Outbound mail transport supplied by the host application.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_mail(&self, to: &[String], subject: &str, body: &str) -> LatchkeyResult<()>;
}

pub struct EmailSink {
    mailer: Arc<dyn Mailer>,
    recipients: Vec<String>,
}

impl std::fmt::Debug for EmailSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSink")
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}

impl EmailSink {
    pub fn new(mailer: Arc<dyn Mailer>, recipients: Vec<String>) -> Self {
        Self { mailer, recipients }
    }

    pub fn subject(alert: &Alert) -> String {
        format!("[{}] {}", alert.level.as_str().to_uppercase(), alert.rule)
    }

    pub fn body(alert: &Alert) -> String {
        let mut body = format!(
            "{}\n\nRule: {}\nLevel: {}\nTriggered at: {}\n",
            alert.message,
            alert.rule,
            alert.level,
            alert.triggered_at.to_rfc3339()
        );
        if !alert.metrics.is_empty() {
            body.push_str("\nMetrics:\n");
            for (name, value) in &alert.metrics {
                body.push_str(&format!("  {name} = {value}\n"));
            }
        }
        body
    }
}

#[async_trait]
impl AlertSink for EmailSink {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> LatchkeyResult<()> {
        if self.recipients.is_empty() {
            return Ok(());
        }
        self.mailer
            .send_mail(&self.recipients, &Self::subject(alert), &Self::body(alert))
            .await
    }
}

// ============================================================================
// COMPOSITE
// ============================================================================

#[derive(Clone, Default)]
pub struct CompositeSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl std::fmt::Debug for CompositeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("CompositeSink").field("sinks", &names).finish()
    }
}

impl CompositeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlertSink for CompositeSink {
    fn name(&self) -> &str {
        "composite"
    }

    /// Delivers to every sink. Fails after trying them all if any failed.
    async fn send(&self, alert: &Alert) -> LatchkeyResult<()> {
        let mut failed = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.send(alert).await {
                tracing::error!(sink = sink.name(), alert_id = %alert.id, error = %e, "Alert sink failed");
                failed.push(sink.name().to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(sink_failed("composite", format!("failed sinks: {}", failed.join(", "))).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertRule;
    use crate::metrics::MetricSnapshot;
    use std::sync::Mutex;

    fn alert() -> Alert {
        let rule = AlertRule::threshold_above("evictions", "local.evictions", 1.0);
        Alert::new(&rule, &MetricSnapshot::new().with("local.evictions", 4.0))
    }

    #[derive(Default)]
    struct MemoryMailer {
        sent: Mutex<Vec<(Vec<String>, String, String)>>,
    }

    #[async_trait]
    impl Mailer for MemoryMailer {
        async fn send_mail(&self, to: &[String], subject: &str, body: &str) -> LatchkeyResult<()> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_vec(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _alert: &Alert) -> LatchkeyResult<()> {
            Err(sink_failed("failing", "down").into())
        }
    }

    #[test]
    fn test_sign_payload() {
        let signature = sign_payload(b"{\"a\":1}", "secret").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(signature, sign_payload(b"{\"a\":1}", "other").unwrap());
        assert_eq!(signature, sign_payload(b"{\"a\":1}", "secret").unwrap());
    }

    #[test]
    fn test_webhook_rejects_bad_url() {
        assert!(WebhookSink::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_email_renders_alert() {
        let mailer = Arc::new(MemoryMailer::default());
        let sink = EmailSink::new(mailer.clone(), vec!["ops@school.test".to_string()]);
        sink.send(&alert()).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "[WARNING] evictions");
        assert!(sent[0].2.contains("local.evictions = 4"));
    }

    #[tokio::test]
    async fn test_composite_keeps_going_after_failure() {
        let mailer = Arc::new(MemoryMailer::default());
        let composite = CompositeSink::new()
            .with(Arc::new(FailingSink))
            .with(Arc::new(LogSink))
            .with(Arc::new(EmailSink::new(mailer.clone(), vec!["a@b.test".into()])));

        let err = composite.send(&alert()).await.unwrap_err();
        assert!(err.to_string().contains("failing"));
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_unreachable_fails() {
        let sink = WebhookSink::new("http://127.0.0.1:9/alerts")
            .unwrap()
            .with_secret("s3cret")
            .with_retries(1, Duration::from_millis(1));
        assert!(sink.send(&alert()).await.is_err());
    }
}
