// ===============================
// src/alert.rs (operator alerts)
// ===============================
//
// Fire-and-forget: alert() never blocks the caller and never fails it.
// Used for settlement errors, compensation failures and hedge-cancel
// failures; never on the success path.
//
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};

use crate::domain::{now_ms, Millis};
use crate::metrics::ALERTS;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
    pub detail: serde_json::Value,
    pub ts_ms: Millis,
}

impl Alert {
    pub fn new(title: &str, contract_id: Option<&str>, detail: serde_json::Value) -> Self {
        Self {
            title: title.to_string(),
            contract_id: contract_id.map(str::to_string),
            detail,
            ts_ms: now_ms(),
        }
    }
}

pub trait Alerter: Send + Sync {
    fn alert(&self, alert: Alert);
}

/// Writes alerts to the log only (no ALERT_WEBHOOK_URL configured).
#[derive(Debug, Default)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, alert: Alert) {
        ALERTS.inc();
        error!(title = %alert.title, contract_id = ?alert.contract_id, detail = %alert.detail, "ALERT");
    }
}

/// Posts alerts as JSON to a chat webhook (Slack-compatible `text` field).
pub struct WebhookAlerter {
    http: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    text: String,
    #[serde(flatten)]
    alert: &'a Alert,
}

impl WebhookAlerter {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url: url.to_string() })
    }
}

impl Alerter for WebhookAlerter {
    fn alert(&self, alert: Alert) {
        ALERTS.inc();
        error!(title = %alert.title, contract_id = ?alert.contract_id, detail = %alert.detail, "ALERT");
        let http = self.http.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            let text = match &alert.contract_id {
                Some(id) => format!("{} #{}", alert.title, id),
                None => alert.title.clone(),
            };
            match http.post(&url).json(&WebhookBody { text, alert: &alert }).send().await {
                Ok(rsp) if rsp.status().is_success() => {}
                Ok(rsp) => warn!(status = %rsp.status(), "alert webhook rejected"),
                Err(e) => warn!(?e, "alert webhook send failed"),
            }
        });
    }
}
