//! Alert fan-out.
//!
//! An incident transition becomes one [`AlertEvent`], which is rendered once
//! and delivered to every channel the monitor's owner configured. Each
//! delivery attempt leaves exactly one history row, sent or failed.

mod channels;
mod message;

pub use channels::*;
pub use message::*;

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;

use crate::config::AlertSettings;
use crate::db::{AlertChannel, AlertStatus, DbError, Monitor, NewAlertHistory, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    Down {
        incident_id: i64,
        error: Option<String>,
    },
    Recovery {
        incident_id: i64,
    },
}

impl AlertEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertEvent::Down { .. } => "down",
            AlertEvent::Recovery { .. } => "recovery",
        }
    }

    pub fn incident_id(&self) -> i64 {
        match self {
            AlertEvent::Down { incident_id, .. } | AlertEvent::Recovery { incident_id } => *incident_id,
        }
    }
}

/// Counts of delivery attempts by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct AlertDispatcher {
    store: Arc<Store>,
    client: Client,
    settings: Arc<AlertSettings>,
    threshold: usize,
}

impl AlertDispatcher {
    pub fn new(store: Arc<Store>, settings: AlertSettings, threshold: usize) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(settings.delivery_timeout)
            .user_agent(concat!("apimon/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            store,
            client,
            settings: Arc::new(settings),
            threshold: threshold.max(1),
        })
    }

    pub async fn dispatch_down(
        &self,
        monitor: &Monitor,
        incident_id: i64,
        error: Option<String>,
    ) -> Result<DispatchReport, DbError> {
        self.dispatch(monitor, &AlertEvent::Down { incident_id, error })
            .await
    }

    pub async fn dispatch_recovery(&self, monitor: &Monitor, incident_id: i64) -> Result<DispatchReport, DbError> {
        self.dispatch(monitor, &AlertEvent::Recovery { incident_id }).await
    }

    /// Deliver an event to all of the owner's channels concurrently.
    ///
    /// Delivery failures are recorded, never returned; only a failure to
    /// load the channel list is an error.
    pub async fn dispatch(&self, monitor: &Monitor, event: &AlertEvent) -> Result<DispatchReport, DbError> {
        let channels = self.store.get_alert_channels(monitor.user_id)?;
        if channels.is_empty() {
            tracing::info!("Alerts: No channels configured for user {}", monitor.user_id);
            return Ok(DispatchReport::default());
        }

        let now = Utc::now();
        let message = render_message(monitor, event, self.threshold, now);
        let note = Notification {
            monitor,
            event,
            message: &message,
            timestamp: now,
        };

        let statuses = join_all(channels.iter().map(|channel| self.send_one(channel, &note))).await;

        let mut report = DispatchReport::default();
        for status in statuses {
            match status {
                AlertStatus::Sent => report.sent += 1,
                AlertStatus::Failed => report.failed += 1,
            }
        }

        tracing::info!(
            "Alerts: {} alert for {}: {} sent, {} failed",
            event.kind(),
            monitor.name,
            report.sent,
            report.failed
        );
        Ok(report)
    }

    async fn send_one(&self, channel: &AlertChannel, note: &Notification<'_>) -> AlertStatus {
        let status = match deliver(&self.client, &self.settings, channel, note).await {
            Ok(()) => AlertStatus::Sent,
            Err(e) => {
                tracing::error!(
                    "Alerts: Failed to send {} alert (channel {}): {}",
                    channel.kind,
                    channel.id,
                    e
                );
                AlertStatus::Failed
            }
        };

        let entry = NewAlertHistory {
            monitor_id: note.monitor.id,
            channel_id: channel.id,
            incident_id: Some(note.event.incident_id()),
            message: note.message.to_string(),
            status,
        };
        if let Err(e) = self.store.add_alert_history(&entry) {
            tracing::error!("Alerts: Failed to record history for channel {}: {}", channel.id, e);
        }

        status
    }
}
