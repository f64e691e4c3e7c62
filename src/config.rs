//! Configuration module for apimon.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the liveness server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "apimon.db")
    pub db_path: String,
    pub probe: ProbeSettings,
    pub alerts: AlertSettings,
    pub schedule: ScheduleSettings,
    /// Consecutive down checks required before an incident opens (default: 3)
    pub failure_threshold: usize,
}

/// Settings consumed by the check runner.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Used when a monitor carries no positive timeout of its own.
    pub default_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub region: String,
    /// Upper bound of the random delay inserted before each probe; 0 disables it.
    pub jitter_ms: u64,
}

/// Global credentials and endpoints for the alert channels.
#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub resend_api_key: Option<String>,
    pub resend_api_base: String,
    pub email_from: String,
    /// Bound on a single channel delivery.
    pub delivery_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub reconcile_interval: Duration,
    /// Offset applied per group index when timers are first started.
    pub group_stagger: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_body_bytes: 1024,
            region: "us-east-1".to_string(),
            jitter_ms: 0,
        }
    }
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            telegram_api_base: "https://api.telegram.org".to_string(),
            resend_api_key: None,
            resend_api_base: "https://api.resend.com".to_string(),
            email_from: "apimon <alerts@apimon.dev>".to_string(),
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            group_stagger: Duration::from_secs(1),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "apimon.db".to_string(),
            probe: ProbeSettings::default(),
            alerts: AlertSettings::default(),
            schedule: ScheduleSettings::default(),
            failure_threshold: 3,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `APIMON_HTTP_PORT`: HTTP port (default: 8080)
    /// - `APIMON_DB_PATH`: Database file path (default: "apimon.db")
    /// - `APIMON_DEFAULT_TIMEOUT_MS`: fallback probe timeout (default: 30000)
    /// - `APIMON_FAILURE_THRESHOLD`: consecutive failures before an incident (default: 3)
    /// - `APIMON_MAX_BODY_BYTES`: captured response body budget (default: 1024)
    /// - `APIMON_REGION`: region tag written on every check (default: "us-east-1")
    /// - `APIMON_PROBE_JITTER_MS`: random pre-probe delay bound (default: 0)
    /// - `APIMON_RECONCILE_SECS`: monitor refresh period (default: 60)
    /// - `APIMON_GROUP_STAGGER_MS`: start offset per interval group (default: 1000)
    /// - `APIMON_ALERT_TIMEOUT_MS`: per-channel delivery timeout (default: 10000)
    /// - `APIMON_EMAIL_FROM`: sender for email alerts
    /// - `TELEGRAM_BOT_TOKEN`, `TELEGRAM_API_BASE`: chat-bot credential and API
    /// - `RESEND_API_KEY`, `RESEND_API_BASE`: mail-provider credential and API
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("APIMON_HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Ok(db_path) = env::var("APIMON_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(threshold) = parse_var::<usize>("APIMON_FAILURE_THRESHOLD") {
            cfg.failure_threshold = threshold.max(1);
        }

        if let Some(ms) = parse_var("APIMON_DEFAULT_TIMEOUT_MS") {
            cfg.probe.default_timeout_ms = ms;
        }
        if let Some(bytes) = parse_var("APIMON_MAX_BODY_BYTES") {
            cfg.probe.max_body_bytes = bytes;
        }
        if let Some(region) = non_empty_var("APIMON_REGION") {
            cfg.probe.region = region;
        }
        if let Some(ms) = parse_var("APIMON_PROBE_JITTER_MS") {
            cfg.probe.jitter_ms = ms;
        }

        if let Some(secs) = parse_var::<u64>("APIMON_RECONCILE_SECS") {
            cfg.schedule.reconcile_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parse_var("APIMON_GROUP_STAGGER_MS") {
            cfg.schedule.group_stagger = Duration::from_millis(ms);
        }

        cfg.alerts.telegram_bot_token = non_empty_var("TELEGRAM_BOT_TOKEN");
        cfg.alerts.resend_api_key = non_empty_var("RESEND_API_KEY");
        if let Some(base) = non_empty_var("TELEGRAM_API_BASE") {
            cfg.alerts.telegram_api_base = base;
        }
        if let Some(base) = non_empty_var("RESEND_API_BASE") {
            cfg.alerts.resend_api_base = base;
        }
        if let Some(from) = non_empty_var("APIMON_EMAIL_FROM") {
            cfg.alerts.email_from = from;
        }
        if let Some(ms) = parse_var::<u64>("APIMON_ALERT_TIMEOUT_MS") {
            cfg.alerts.delivery_timeout = Duration::from_millis(ms.max(1));
        }

        cfg
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
