//! Notifier: fire-and-forget webhook sink for terminal job transitions.

use log::warn;
use serde_json::json;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Notifier {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    /// Posts `text` to the configured webhook. A union JSON shape
    /// compatible with several common webhook receivers. Never propagates
    /// failure — logged and swallowed.
    pub async fn notify(&self, text: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };

        let body = json!({
            "msgtype": "text",
            "text": { "content": text },
            "content": text,
        });

        let result = self
            .client
            .post(url)
            .timeout(TIMEOUT)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!("webhook POST to {url} returned {}", response.status());
            }
            Err(err) => {
                warn!("webhook POST to {url} failed: {err}");
            }
            Ok(_) => {}
        }
    }
}
