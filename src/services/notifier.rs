//! Operator alerts for fatal and batch-aborting conditions.

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub run_id: Uuid,
    pub subject: String,
    pub detail: String,
    /// Files the alert concerns, if any.
    pub files: Vec<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the error log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        error!(
            run_id = %alert.run_id,
            files = ?alert.files,
            detail = %alert.detail,
            "ALERT: {}",
            alert.subject
        );
        Ok(())
    }
}

/// Logs the alert, then POSTs it as JSON to a webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        LogNotifier.notify(alert).await?;
        self.http
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("posting alert to {}", self.url))?;
        Ok(())
    }
}

/// Deliver an alert; a failing notifier never changes the run outcome.
pub async fn send(notifier: &dyn Notifier, alert: Alert) {
    if let Err(err) = notifier.notify(&alert).await {
        warn!(error = %err, subject = %alert.subject, "alert delivery failed");
    }
}
