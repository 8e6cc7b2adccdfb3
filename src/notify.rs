//! Outbound webhook for status events.
//!
//! Delivery is fire-and-forget on a spawned task. A slow or failing endpoint
//! never delays or fails the replication path.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ReplicationError, ReplicationResult};
use crate::models::ChangeSignal;
use crate::replication::GuardEvent;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Event posted to the webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    SignalEmitted {
        leader_id: String,
        ticket: i64,
        event_type: String,
        symbol: String,
        signal_id: String,
    },
    GuardChanged(GuardEvent),
    AccountsOffline {
        account_ids: Vec<String>,
    },
}

impl StatusEvent {
    pub fn signal(signal: &ChangeSignal) -> Self {
        StatusEvent::SignalEmitted {
            leader_id: signal.leader_id.clone(),
            ticket: signal.ticket,
            event_type: signal.event_type.as_str().to_string(),
            symbol: signal.symbol.clone(),
            signal_id: signal.id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a StatusEvent,
    sent_at: DateTime<Utc>,
}

/// Webhook notifier. Without a URL every call is a no-op.
#[derive(Clone)]
pub struct Notifier {
    client: Client,
    url: Option<String>,
}

impl Notifier {
    pub fn new(url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }

    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            url: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Queue delivery and return immediately.
    pub fn notify(&self, event: StatusEvent) {
        if self.url.is_none() {
            return;
        }

        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.deliver(&event).await {
                warn!(error = %e, "Status webhook delivery failed");
            }
        });
    }

    async fn deliver(&self, event: &StatusEvent) -> ReplicationResult<()> {
        let Some(url) = &self.url else {
            return Ok(());
        };

        let body = Envelope {
            event,
            sent_at: Utc::now(),
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReplicationError::TransientInfra(format!("webhook unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(ReplicationError::TransientInfra(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        debug!(url = %url, "Status event delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_shape() {
        let event = StatusEvent::AccountsOffline {
            account_ids: vec!["F1".to_string()],
        };
        let body = Envelope {
            event: &event,
            sent_at: Utc::now(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["event"], "accounts_offline");
        assert_eq!(json["account_ids"][0], "F1");
        assert!(json["sent_at"].is_string());
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_noop() {
        let notifier = Notifier::disabled();
        assert!(!notifier.is_enabled());
        notifier.notify(StatusEvent::AccountsOffline { account_ids: vec![] });
        tokio_test::assert_ok!(notifier.deliver(&StatusEvent::AccountsOffline { account_ids: vec![] }).await);
    }

    #[tokio::test]
    async fn test_unreachable_webhook_degrades() {
        let notifier = Notifier::new(Some("http://127.0.0.1:9/hook".to_string())).unwrap();
        let err = notifier
            .deliver(&StatusEvent::AccountsOffline { account_ids: vec![] })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Degraded);
    }
}
