//! Alert message text shared by every channel.

use chrono::{DateTime, SecondsFormat, Utc};

use super::AlertEvent;
use crate::db::Monitor;

const UNKNOWN_ERROR: &str = "Unknown error";

/// Render the human-readable body for an event, formatted for HTML-aware chat clients.
pub fn render_message(monitor: &Monitor, event: &AlertEvent, threshold: usize, at: DateTime<Utc>) -> String {
    let name = escape_html(&monitor.name);
    let url = escape_html(&monitor.url);
    let time = iso_timestamp(at);

    let lines = match event {
        AlertEvent::Down { error, .. } => vec![
            "🔴 <b>Monitor DOWN</b>".to_string(),
            String::new(),
            format!("<b>Name:</b> {}", name),
            format!("<b>URL:</b> {}", url),
            format!(
                "<b>Error:</b> {}",
                escape_html(error.as_deref().unwrap_or(UNKNOWN_ERROR))
            ),
            format!("<b>Time:</b> {}", time),
            String::new(),
            format!("This monitor has failed {} consecutive checks.", threshold),
        ],
        AlertEvent::Recovery { .. } => vec![
            "🟢 <b>Monitor RECOVERED</b>".to_string(),
            String::new(),
            format!("<b>Name:</b> {}", name),
            format!("<b>URL:</b> {}", url),
            format!("<b>Time:</b> {}", time),
            String::new(),
            "The monitor is responding normally again.".to_string(),
        ],
    };

    lines.join("\n")
}

pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn monitor() -> Monitor {
        Monitor {
            id: 7,
            name: "Billing <prod>".to_string(),
            url: "https://billing.example.com/health?a=1&b=2".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_down_message() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let event = AlertEvent::Down {
            incident_id: 1,
            error: Some("Expected status 200, got 500".to_string()),
        };
        let text = render_message(&monitor(), &event, 3, at);

        assert!(text.starts_with("🔴 <b>Monitor DOWN</b>\n\n"));
        assert!(text.contains("<b>Name:</b> Billing &lt;prod&gt;"));
        assert!(text.contains("<b>URL:</b> https://billing.example.com/health?a=1&amp;b=2"));
        assert!(text.contains("<b>Error:</b> Expected status 200, got 500"));
        assert!(text.contains("<b>Time:</b> 2024-05-01T12:30:00.000Z"));
        assert!(text.ends_with("This monitor has failed 3 consecutive checks."));
    }

    #[test]
    fn test_down_message_without_error() {
        let event = AlertEvent::Down {
            incident_id: 1,
            error: None,
        };
        let text = render_message(&monitor(), &event, 5, Utc::now());
        assert!(text.contains("<b>Error:</b> Unknown error"));
        assert!(text.ends_with("failed 5 consecutive checks."));
    }

    #[test]
    fn test_recovery_message() {
        let event = AlertEvent::Recovery { incident_id: 1 };
        let text = render_message(&monitor(), &event, 3, Utc::now());
        assert!(text.starts_with("🟢 <b>Monitor RECOVERED</b>"));
        assert!(!text.contains("Error:"));
        assert!(text.ends_with("The monitor is responding normally again."));
    }
}
