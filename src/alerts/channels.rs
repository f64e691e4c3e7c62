//! Per-kind delivery: payload construction and the HTTP call.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use super::message::iso_timestamp;
use super::AlertEvent;
use crate::config::AlertSettings;
use crate::db::{AlertChannel, ChannelKind, Monitor};

const WEBHOOK_USER_AGENT: &str = "apimon-webhook/1.0";

const DOWN_COLOR: u32 = 0xdc2626;
const RECOVERY_COLOR: u32 = 0x16a34a;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("{0} not configured")]
    MissingSetting(&'static str),
    #[error("{0} not set")]
    MissingCredential(&'static str),
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("{target} error: {status} {body}")]
    Rejected {
        target: &'static str,
        status: u16,
        body: String,
    },
}

/// One event, already rendered, ready to go out on any channel.
#[derive(Debug, Clone)]
pub struct Notification<'a> {
    pub monitor: &'a Monitor,
    pub event: &'a AlertEvent,
    pub message: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl Notification<'_> {
    fn is_down(&self) -> bool {
        matches!(self.event, AlertEvent::Down { .. })
    }

    fn title(&self) -> &'static str {
        if self.is_down() {
            "🔴 Monitor Down"
        } else {
            "🟢 Monitor Recovered"
        }
    }

    fn color(&self) -> u32 {
        if self.is_down() {
            DOWN_COLOR
        } else {
            RECOVERY_COLOR
        }
    }
}

/// Deliver a notification to one channel.
pub async fn deliver(
    client: &Client,
    settings: &AlertSettings,
    channel: &AlertChannel,
    note: &Notification<'_>,
) -> Result<(), DeliveryError> {
    match channel.kind {
        ChannelKind::Telegram => {
            let token = settings
                .telegram_bot_token
                .as_deref()
                .ok_or(DeliveryError::MissingCredential("TELEGRAM_BOT_TOKEN"))?;
            let chat_id = required(channel, "chatId")?;
            let url = format!(
                "{}/bot{}/sendMessage",
                settings.telegram_api_base.trim_end_matches('/'),
                token
            );
            post_json(client.post(url), "Telegram API", &telegram_payload(&chat_id, note)).await
        }
        ChannelKind::Slack => {
            let url = required(channel, "webhookUrl")?;
            post_json(client.post(url), "Slack webhook", &slack_payload(note)).await
        }
        ChannelKind::Discord => {
            let url = required(channel, "webhookUrl")?;
            post_json(client.post(url), "Discord webhook", &discord_payload(note)).await
        }
        ChannelKind::Email => {
            let key = settings
                .resend_api_key
                .as_deref()
                .ok_or(DeliveryError::MissingCredential("RESEND_API_KEY"))?;
            let to = required(channel, "email")?;
            let url = format!("{}/emails", settings.resend_api_base.trim_end_matches('/'));
            let request = client.post(url).bearer_auth(key);
            post_json(request, "Resend API", &email_payload(&settings.email_from, &to, note)).await
        }
        ChannelKind::Webhook => {
            let url = required(channel, "url")?;
            let request = client
                .post(url)
                .header(reqwest::header::USER_AGENT, WEBHOOK_USER_AGENT);
            post_json(request, "Webhook", &webhook_payload(note)).await
        }
    }
}

fn required(channel: &AlertChannel, key: &'static str) -> Result<String, DeliveryError> {
    channel.setting(key).ok_or(DeliveryError::MissingSetting(key))
}

async fn post_json(
    request: reqwest::RequestBuilder,
    target: &'static str,
    payload: &Value,
) -> Result<(), DeliveryError> {
    let response = request.json(payload).send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(DeliveryError::Rejected {
        target,
        status: status.as_u16(),
        body,
    })
}

pub fn telegram_payload(chat_id: &str, note: &Notification<'_>) -> Value {
    json!({
        "chat_id": chat_id,
        "text": note.message,
        "parse_mode": "HTML",
    })
}

pub fn slack_payload(note: &Notification<'_>) -> Value {
    json!({
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": note.title() },
            },
            {
                "type": "section",
                "fields": [
                    { "type": "mrkdwn", "text": format!("*Monitor:*\n{}", note.monitor.name) },
                    { "type": "mrkdwn", "text": format!("*URL:*\n{}", note.monitor.url) },
                ],
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": note.message },
            },
        ],
        "attachments": [
            { "color": format!("#{:06x}", note.color()), "text": "" },
        ],
    })
}

pub fn discord_payload(note: &Notification<'_>) -> Value {
    json!({
        "embeds": [
            {
                "title": note.title(),
                "description": note.message,
                "color": note.color(),
                "fields": [
                    { "name": "Monitor", "value": note.monitor.name, "inline": true },
                    { "name": "URL", "value": note.monitor.url, "inline": true },
                ],
                "timestamp": iso_timestamp(note.timestamp),
            },
        ],
    })
}

pub fn email_payload(from: &str, to: &str, note: &Notification<'_>) -> Value {
    let subject = if note.is_down() {
        format!("🔴 DOWN: {} is not responding", note.monitor.name)
    } else {
        format!("🟢 RECOVERED: {} is back up", note.monitor.name)
    };

    json!({
        "from": from,
        "to": [to],
        "subject": subject,
        "text": note.message,
    })
}

pub fn webhook_payload(note: &Notification<'_>) -> Value {
    json!({
        "type": note.event.kind(),
        "monitor": {
            "id": note.monitor.id,
            "name": note.monitor.name,
            "url": note.monitor.url,
        },
        "incidentId": note.event.incident_id(),
        "message": note.message,
        "timestamp": iso_timestamp(note.timestamp),
    })
}
