//! Webhook Notifier
//!
//! POSTs the finished `DeploymentRecord` as JSON to an operator-supplied URL
//! (chat relay, CI hook, ...). Only outcomes that touched a container are
//! sent; skips and dry runs stay in the log.

use std::time::Duration;
use tracing::{info, warn};

use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::DeploymentRecord;
use crate::utils::constants::USER_AGENT;

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a record is worth notifying about
    pub fn should_notify(record: &DeploymentRecord) -> bool {
        record.status.is_notable()
    }

    /// Send one notification
    pub async fn send(&self, record: &DeploymentRecord) -> AppResult<()> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(record)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::new(
                ErrorCode::NotifyFailed,
                format!("Webhook returned HTTP {}", status.as_u16()),
            ));
        }
        Ok(())
    }

    /// Fire-and-log: notification failures never fail a deployment
    pub async fn notify(&self, record: &DeploymentRecord) {
        if !Self::should_notify(record) {
            return;
        }
        match self.send(record).await {
            Ok(()) => info!(rule = %record.rule, status = record.status.as_str(), "📨 Webhook delivered"),
            Err(e) => warn!(rule = %record.rule, code = e.code_str(), "Webhook failed: {}", e),
        }
    }
}
