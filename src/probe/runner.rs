//! Check runner: one probe, one persisted check, one hand-off to incident tracking.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::task::JoinHandle;

use super::run_http_probe;
use crate::config::ProbeSettings;
use crate::db::{Check, DbError, Monitor, NewCheck, Store};
use crate::incident::{IncidentTracker, Transition};

/// Everything one invocation of [`CheckRunner::run_check`] produced.
#[derive(Debug)]
pub struct CheckOutcome {
    pub check: Check,
    pub transition: Option<Transition>,
    /// Background alert fan-out started for the transition, if any.
    pub dispatch: Option<JoinHandle<()>>,
}

pub struct CheckRunner {
    client: Client,
    store: Arc<Store>,
    incidents: Arc<IncidentTracker>,
    settings: ProbeSettings,
}

impl CheckRunner {
    pub fn new(
        store: Arc<Store>,
        incidents: Arc<IncidentTracker>,
        settings: ProbeSettings,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("apimon/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            store,
            incidents,
            settings,
        })
    }

    /// Probe a monitor, persist exactly one check, then evaluate incidents.
    ///
    /// Fails only when the check cannot be persisted; incident evaluation is
    /// skipped in that case.
    pub async fn run_check(&self, monitor: &Monitor) -> Result<CheckOutcome, DbError> {
        if self.settings.jitter_ms > 0 {
            let jitter = rand::random::<u64>() % self.settings.jitter_ms;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let timeout_ms = if monitor.timeout_ms > 0 {
            monitor.timeout_ms as u64
        } else {
            self.settings.default_timeout_ms
        };

        let probe = run_http_probe(&self.client, monitor, timeout_ms, self.settings.max_body_bytes).await;
        let error_message = probe.error.as_ref().map(|e| e.to_string());

        let check = self
            .store
            .add_check(&NewCheck {
                monitor_id: monitor.id,
                status_code: probe.status_code,
                response_time_ms: probe.response_time_ms,
                is_up: probe.is_up(),
                error_message: error_message.clone(),
                response_body: probe.body,
                region: self.settings.region.clone(),
                checked_at: Utc::now(),
            })
            .map_err(|e| {
                tracing::error!("Check: Failed to save check for {} (id={}): {}", monitor.name, monitor.id, e);
                e
            })?;

        tracing::info!(
            "Check: {} ({}) - {} - {}ms - {}",
            monitor.name,
            monitor.url,
            if check.is_up { "UP" } else { "DOWN" },
            check.response_time_ms,
            check
                .status_code
                .map(|s| s.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
        );

        let transition = match self
            .incidents
            .evaluate(monitor, check.is_up, error_message.as_deref())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Check: Incident evaluation failed for {} (id={}): {}", monitor.name, monitor.id, e);
                None
            }
        };

        let dispatch = transition
            .as_ref()
            .map(|t| self.incidents.notify(monitor, t));

        Ok(CheckOutcome {
            check,
            transition,
            dispatch,
        })
    }
}
