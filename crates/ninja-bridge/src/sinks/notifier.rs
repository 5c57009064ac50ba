//! Push notifications
//!
//! `notify` is fire-and-forget: the HTTP request runs on its own task and
//! its outcome is only logged.

use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::NotifierConfig;
use crate::error::{BridgeError, Result};

/// Sink for human-facing alerts
pub trait Notifier: Send + Sync {
    /// Send `message`, with the default title when `title` is `None`.
    ///
    /// Never blocks and never fails from the caller's point of view.
    fn notify(&self, message: &str, title: Option<&str>);
}

/// Notifier that only logs
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, message: &str, title: Option<&str>) {
        debug!(title = title.unwrap_or_default(), message, "Notification dropped (no notifier)");
    }
}

/// Pushover message API client
#[derive(Debug, Clone)]
pub struct PushoverNotifier {
    client: reqwest::Client,
    config: NotifierConfig,
}

impl PushoverNotifier {
    /// Create from notifier configuration
    pub fn new(config: NotifierConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BridgeError::sink("notifier", e))?;
        Ok(Self { client, config })
    }

    /// Check if credentials are present
    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Send one message and wait for the result.
    ///
    /// Without credentials this logs and returns `Ok` without a request.
    pub async fn send(&self, message: &str, title: Option<&str>) -> Result<()> {
        let (Some(user), Some(token)) = (&self.config.user_key, &self.config.api_token) else {
            warn!(message, "Pushover credentials missing, notification not sent");
            return Ok(());
        };

        let title = title.unwrap_or(&self.config.default_title);
        let response = self
            .client
            .post(&self.config.endpoint)
            .form(&[
                ("token", token.as_str()),
                ("user", user.as_str()),
                ("message", message),
                ("title", title),
            ])
            .send()
            .await
            .map_err(|e| BridgeError::sink("notifier", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::sink(
                "notifier",
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }

        info!(title, "Notification sent");
        Ok(())
    }

    /// Request timeout
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

impl Notifier for PushoverNotifier {
    fn notify(&self, message: &str, title: Option<&str>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(message, "No runtime available, notification not sent");
            return;
        };

        let notifier = self.clone();
        let message = message.to_string();
        let title = title.map(str::to_string);
        runtime.spawn(async move {
            if let Err(e) = notifier.send(&message, title.as_deref()).await {
                error!(error = %e, code = e.error_code(), "Notification failed");
            }
        });
    }
}
