//! Out-of-band alerts for stranded sponsor capital.

use serde_json::json;
use tracing::{debug, warn};

/// Fire-and-forget notification sink. Implementations must not block.
pub trait AlertSink: Send + Sync {
    fn notify(&self, message: String);
}

/// Writes alerts to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, message: String) {
        warn!("[ALERT] {}", message);
    }
}

/// Logs the alert and POSTs `{"text": message}` to a webhook in the
/// background. Delivery failures are logged and dropped.
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, message: String) {
        warn!("[ALERT] {}", message);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available, webhook alert skipped");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            let result = client
                .post(&url)
                .json(&json!({ "text": message }))
                .send()
                .await
                .and_then(|r| r.error_for_status());
            if let Err(e) = result {
                warn!("Failed to deliver alert webhook: {}", e);
            }
        });
    }
}
