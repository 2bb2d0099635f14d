//! Best-effort operator notifications.
//!
//! Notification delivery must never influence the sync outcome: failures are
//! logged and swallowed.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, warn};

pub const NOTIFY_SUBJECT: &str = "MONITORING-candlesync";

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str);
}

/// POSTs `{subject, text}` JSON to a configured webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, message: &str) {
        let body = json!({
            "subject": NOTIFY_SUBJECT,
            "text": message,
        });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(status = %resp.status(), "notification webhook rejected message");
            }
            Err(e) => {
                warn!(error = %e, "notification webhook unreachable");
            }
        }
    }
}

/// Fallback sink when no webhook is configured: the notification becomes an
/// error-level log line.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, message: &str) {
        error!(subject = NOTIFY_SUBJECT, "{message}");
    }
}
