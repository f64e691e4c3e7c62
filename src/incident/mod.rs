//! Incident state machine.
//!
//! Per monitor there are two states: no incident, or one `ongoing` incident.
//! The latest check plus the stored incident decide the transition:
//!
//! | ongoing? | latest check | action                                         |
//! |----------|--------------|------------------------------------------------|
//! | yes      | up           | resolve, recovery alert                        |
//! | no       | down         | open if the last N checks are all down, alert  |
//! | yes      | down         | nothing                                        |
//! | no       | up           | nothing                                        |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::alerts::AlertDispatcher;
use crate::db::{DbError, Incident, Monitor, Store};

/// Cause recorded when the triggering check carried no error description.
pub const DEFAULT_CAUSE: &str = "Multiple consecutive check failures";

/// A state change produced by one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened {
        incident: Incident,
        /// Error description of the check that opened the incident.
        error: Option<String>,
    },
    Resolved {
        incident: Incident,
    },
}

impl Transition {
    pub fn incident(&self) -> &Incident {
        match self {
            Transition::Opened { incident, .. } | Transition::Resolved { incident } => incident,
        }
    }
}

pub struct IncidentTracker {
    store: Arc<Store>,
    dispatcher: AlertDispatcher,
    threshold: usize,
    /// Serialises evaluation per monitor.
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl IncidentTracker {
    pub fn new(store: Arc<Store>, dispatcher: AlertDispatcher, threshold: usize) -> Self {
        Self {
            store,
            dispatcher,
            threshold: threshold.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply the latest check to the monitor's incident state.
    ///
    /// Must run after the check itself has been persisted.
    pub async fn evaluate(
        &self,
        monitor: &Monitor,
        is_up: bool,
        error: Option<&str>,
    ) -> Result<Option<Transition>, DbError> {
        let lock = self.monitor_lock(monitor.id);
        let result = {
            let _guard = lock.lock().await;
            self.evaluate_locked(monitor, is_up, error)
        };
        self.release_lock(monitor.id, lock);
        result
    }

    fn evaluate_locked(
        &self,
        monitor: &Monitor,
        is_up: bool,
        error: Option<&str>,
    ) -> Result<Option<Transition>, DbError> {
        let ongoing = self.store.get_ongoing_incident(monitor.id)?;

        match (ongoing, is_up) {
            (Some(incident), true) => {
                let resolved = self.store.resolve_incident(incident.id, Utc::now())?;
                tracing::info!(
                    "Incident: Resolved #{} - {} is back up",
                    resolved.id,
                    monitor.name
                );
                Ok(Some(Transition::Resolved { incident: resolved }))
            }
            (None, false) => {
                let recent = self.store.get_recent_checks(monitor.id, self.threshold)?;
                let all_failed = recent.len() >= self.threshold && recent.iter().all(|c| !c.is_up);
                if !all_failed {
                    return Ok(None);
                }

                let cause = error.unwrap_or(DEFAULT_CAUSE);
                match self.store.create_incident(monitor.id, cause) {
                    Ok(incident) => {
                        tracing::warn!(
                            "Incident: Created #{} - {} is DOWN: {}",
                            incident.id,
                            monitor.name,
                            cause
                        );
                        Ok(Some(Transition::Opened {
                            incident,
                            error: error.map(str::to_string),
                        }))
                    }
                    Err(DbError::Conflict(reason)) => {
                        tracing::warn!("Incident: Skipping duplicate incident for {}: {}", monitor.name, reason);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            (Some(_), false) | (None, true) => Ok(None),
        }
    }

    /// Start the alert fan-out for a transition in the background.
    pub fn notify(&self, monitor: &Monitor, transition: &Transition) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let monitor = monitor.clone();
        let transition = transition.clone();

        tokio::spawn(async move {
            let result = match &transition {
                Transition::Opened { incident, error } => {
                    dispatcher
                        .dispatch_down(&monitor, incident.id, error.clone())
                        .await
                }
                Transition::Resolved { incident } => {
                    dispatcher.dispatch_recovery(&monitor, incident.id).await
                }
            };

            if let Err(e) = result {
                tracing::error!(
                    "Incident: Alert dispatch failed for {} (incident #{}): {}",
                    monitor.name,
                    transition.incident().id,
                    e
                );
            }
        })
    }

    fn monitor_lock(&self, monitor_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(monitor_id).or_default().clone()
    }

    /// Drop the map entry once no other evaluation holds or awaits it.
    fn release_lock(&self, monitor_id: i64, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        if locks
            .get(&monitor_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&monitor_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}
