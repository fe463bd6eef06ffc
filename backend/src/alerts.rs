//! Fire-and-forget operational alerts.
//!
//! Producers publish onto a bounded channel with `try_send` and move on; the
//! dispatcher task persists and logs them. A slow or failing sink can only
//! cost alerts, never settlement latency.

use std::sync::Arc;

use serde::Serialize;
use shared::AlertSeverity;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::store::AlertSink;

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

#[derive(Clone)]
pub struct AlertPublisher {
    tx: mpsc::Sender<AlertEvent>,
}

impl AlertPublisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<AlertEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn send_alert(
        &self,
        alert_type: &str,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) {
        let alert = AlertEvent {
            alert_type: alert_type.to_string(),
            severity,
            title: title.into(),
            message: message.into(),
            metadata,
        };

        match self.tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                tracing::warn!(
                    "Alert channel full, dropping {} alert: {}",
                    alert.alert_type,
                    alert.title
                );
            }
            Err(TrySendError::Closed(alert)) => {
                tracing::warn!(
                    "Alert dispatcher stopped, dropping {} alert: {}",
                    alert.alert_type,
                    alert.title
                );
            }
        }
    }
}

pub async fn run_alert_dispatcher(mut rx: mpsc::Receiver<AlertEvent>, sink: Arc<dyn AlertSink>) {
    tracing::info!("Alert dispatcher started");

    while let Some(alert) = rx.recv().await {
        match alert.severity {
            AlertSeverity::Critical => tracing::error!(
                alert_type = %alert.alert_type,
                "ALERT {}: {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::Warning => tracing::warn!(
                alert_type = %alert.alert_type,
                "ALERT {}: {}",
                alert.title,
                alert.message
            ),
            AlertSeverity::Info => tracing::info!(
                alert_type = %alert.alert_type,
                "ALERT {}: {}",
                alert.title,
                alert.message
            ),
        }

        if let Err(e) = sink.create_alert(&alert).await {
            tracing::error!("Failed to persist {} alert: {}", alert.alert_type, e);
        }
    }

    tracing::info!("Alert dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (publisher, mut rx) = AlertPublisher::channel(1);

        publisher.send_alert("a", AlertSeverity::Info, "first", "m", serde_json::Value::Null);
        publisher.send_alert("b", AlertSeverity::Info, "second", "m", serde_json::Value::Null);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.alert_type, "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatcher_persists_alerts() {
        let store = Arc::new(MemoryStore::new());
        let (publisher, rx) = AlertPublisher::channel(8);

        publisher.send_alert(
            "provider_disabled",
            AlertSeverity::Critical,
            "Provider Disabled: X",
            "three issues",
            serde_json::json!({ "provider_id": "x" }),
        );
        drop(publisher);

        run_alert_dispatcher(rx, store.clone()).await;

        let alerts = store.active_alerts(10).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "provider_disabled");
        assert_eq!(alerts[0].severity, "critical");
    }
}
