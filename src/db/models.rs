//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A stored text value that does not name a known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

/// An HTTP endpoint checked on a fixed cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
    pub expected_status: u16,
    pub check_interval_seconds: i64,
    pub timeout_ms: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Monitor {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id: 0,
            name: String::new(),
            url: String::new(),
            method: "GET".to_string(),
            headers: None,
            body: None,
            expected_status: 200,
            check_interval_seconds: 300,
            timeout_ms: 30_000,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Monitor {
    /// Interval used for grouping; never zero.
    pub fn interval_secs(&self) -> u64 {
        self.check_interval_seconds.max(1) as u64
    }
}

/// A single persisted probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub id: i64,
    pub monitor_id: i64,
    /// Absent when no response was received.
    pub status_code: Option<u16>,
    pub response_time_ms: i64,
    pub is_up: bool,
    pub error_message: Option<String>,
    pub response_body: Option<String>,
    pub region: String,
    pub checked_at: DateTime<Utc>,
}

/// A check about to be written; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewCheck {
    pub monitor_id: i64,
    pub status_code: Option<u16>,
    pub response_time_ms: i64,
    pub is_up: bool,
    pub error_message: Option<String>,
    pub response_body: Option<String>,
    pub region: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentState {
    Ongoing,
    Resolved,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Ongoing => "ongoing",
            IncidentState::Resolved => "resolved",
        }
    }
}

impl FromStr for IncidentState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(IncidentState::Ongoing),
            "resolved" => Ok(IncidentState::Resolved),
            other => Err(UnknownVariant {
                what: "incident state",
                value: other.to_string(),
            }),
        }
    }
}

/// A contiguous unhealthy period for one monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: i64,
    pub monitor_id: i64,
    pub state: IncidentState,
    pub cause: Option<String>,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// The closed set of notification targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Telegram bot message.
    Telegram,
    /// Slack incoming webhook (block payload).
    Slack,
    /// Discord webhook (embed payload).
    Discord,
    /// Email through the Resend API.
    Email,
    /// Generic JSON webhook.
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Slack => "slack",
            ChannelKind::Discord => "discord",
            ChannelKind::Email => "email",
            ChannelKind::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(ChannelKind::Telegram),
            "slack" => Ok(ChannelKind::Slack),
            "discord" => Ok(ChannelKind::Discord),
            "email" => Ok(ChannelKind::Email),
            "webhook" => Ok(ChannelKind::Webhook),
            other => Err(UnknownVariant {
                what: "channel kind",
                value: other.to_string(),
            }),
        }
    }
}

/// A user-scoped notification target.
#[derive(Debug, Clone, Serialize)]
pub struct AlertChannel {
    pub id: i64,
    pub user_id: i64,
    pub kind: ChannelKind,
    /// Kind-specific settings, e.g. `webhookUrl`, `chatId`, `email`, `url`.
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl AlertChannel {
    /// A non-empty setting, if present. Numbers are accepted (chat ids often are).
    pub fn setting(&self, key: &str) -> Option<String> {
        match self.config.get(key)? {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Sent,
    Failed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Sent => "sent",
            AlertStatus::Failed => "failed",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(AlertStatus::Sent),
            "failed" => Ok(AlertStatus::Failed),
            other => Err(UnknownVariant {
                what: "alert status",
                value: other.to_string(),
            }),
        }
    }
}

/// One delivery attempt of one event to one channel.
#[cfg(test)]
#[derive(Debug, Clone, Serialize)]
pub struct AlertHistory {
    pub id: i64,
    pub monitor_id: i64,
    pub channel_id: i64,
    pub incident_id: Option<i64>,
    pub message: String,
    pub status: AlertStatus,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAlertHistory {
    pub monitor_id: i64,
    pub channel_id: i64,
    pub incident_id: Option<i64>,
    pub message: String,
    pub status: AlertStatus,
}
