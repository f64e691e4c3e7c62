//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const MONITOR_COLUMNS: &str = "id, user_id, name, url, method, headers, body, expected_status, \
     check_interval_seconds, timeout_ms, is_active, created_at, updated_at";

const CHECK_COLUMNS: &str = "id, monitor_id, status_code, response_time_ms, is_up, error_message, \
     response_body, region, checked_at";

const INCIDENT_COLUMNS: &str = "id, monitor_id, state, cause, started_at, resolved_at";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Constraint violated: {0}")]
    Conflict(String),
    #[error("Database lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Run arbitrary SQL against the database.
    #[cfg(test)]
    pub fn execute_raw(&self, sql: &str) -> Result<(), DbError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    // --- Monitors ---

    /// All monitors with the active flag set.
    pub fn get_active_monitors(&self) -> Result<Vec<Monitor>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MONITOR_COLUMNS} FROM monitors WHERE is_active = 1 ORDER BY id"
        ))?;
        let monitors = stmt
            .query_map([], monitor_from_row)?
            .filter_map(|row| match row {
                Ok(monitor) => Some(monitor),
                Err(e) => {
                    tracing::warn!("Store: Skipping unreadable monitor row: {}", e);
                    None
                }
            })
            .collect();
        Ok(monitors)
    }

    #[cfg(test)]
    pub fn get_monitor(&self, id: i64) -> Result<Monitor, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {MONITOR_COLUMNS} FROM monitors WHERE id = ?1"),
            params![id],
            monitor_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Add a new monitor and return its ID.
    #[cfg(test)]
    pub fn add_monitor(&self, monitor: &mut Monitor) -> Result<i64, DbError> {
        let headers = encode_headers(&monitor.headers)?;
        let now = Utc::now();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO monitors (user_id, name, url, method, headers, body, expected_status, \
             check_interval_seconds, timeout_ms, is_active, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                monitor.user_id,
                monitor.name,
                monitor.url,
                monitor.method,
                headers,
                monitor.body,
                monitor.expected_status,
                monitor.check_interval_seconds,
                monitor.timeout_ms,
                monitor.is_active,
                format_time(&now),
            ],
        )?;
        monitor.id = conn.last_insert_rowid();
        monitor.created_at = now;
        monitor.updated_at = now;
        Ok(monitor.id)
    }

    /// Update the mutable configuration of an existing monitor.
    #[cfg(test)]
    pub fn update_monitor(&self, monitor: &Monitor) -> Result<(), DbError> {
        let headers = encode_headers(&monitor.headers)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE monitors SET name=?1, url=?2, method=?3, headers=?4, body=?5, expected_status=?6, \
             check_interval_seconds=?7, timeout_ms=?8, is_active=?9, updated_at=?10 WHERE id=?11",
            params![
                monitor.name,
                monitor.url,
                monitor.method,
                headers,
                monitor.body,
                monitor.expected_status,
                monitor.check_interval_seconds,
                monitor.timeout_ms,
                monitor.is_active,
                format_time(&Utc::now()),
                monitor.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn set_monitor_active(&self, id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE monitors SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active, format_time(&Utc::now()), id],
        )?;
        Ok(())
    }

    /// Delete a monitor and everything recorded for it.
    #[cfg(test)]
    pub fn delete_monitor(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM alert_history WHERE monitor_id = ?1", params![id])?;
        conn.execute("DELETE FROM incidents WHERE monitor_id = ?1", params![id])?;
        conn.execute("DELETE FROM checks WHERE monitor_id = ?1", params![id])?;
        conn.execute("DELETE FROM monitors WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Checks ---

    /// Persist one probe result.
    pub fn add_check(&self, check: &NewCheck) -> Result<Check, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO checks (monitor_id, status_code, response_time_ms, is_up, error_message, \
             response_body, region, checked_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                check.monitor_id,
                check.status_code,
                check.response_time_ms,
                check.is_up,
                check.error_message,
                check.response_body,
                check.region,
                format_time(&check.checked_at),
            ],
        )?;

        Ok(Check {
            id: conn.last_insert_rowid(),
            monitor_id: check.monitor_id,
            status_code: check.status_code,
            response_time_ms: check.response_time_ms,
            is_up: check.is_up,
            error_message: check.error_message.clone(),
            response_body: check.response_body.clone(),
            region: check.region.clone(),
            checked_at: check.checked_at,
        })
    }

    /// The most recent `limit` checks for a monitor, newest first.
    pub fn get_recent_checks(&self, monitor_id: i64, limit: usize) -> Result<Vec<Check>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks WHERE monitor_id = ?1 \
             ORDER BY checked_at DESC, id DESC LIMIT ?2"
        ))?;
        let checks = stmt
            .query_map(params![monitor_id, limit as i64], check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    /// Every check for a monitor, oldest first.
    #[cfg(test)]
    pub fn get_checks(&self, monitor_id: i64) -> Result<Vec<Check>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks WHERE monitor_id = ?1 ORDER BY checked_at ASC, id ASC"
        ))?;
        let checks = stmt
            .query_map(params![monitor_id], check_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(checks)
    }

    // --- Incidents ---

    pub fn get_ongoing_incident(&self, monitor_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn()?;
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE monitor_id = ?1 AND state = 'ongoing'"
                ),
                params![monitor_id],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    /// Open a new incident. Fails with `Conflict` if one is already ongoing.
    pub fn create_incident(&self, monitor_id: i64, cause: &str) -> Result<Incident, DbError> {
        let started_at = Utc::now();
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO incidents (monitor_id, state, cause, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                monitor_id,
                IncidentState::Ongoing.as_str(),
                cause,
                format_time(&started_at)
            ],
        );

        match inserted {
            Ok(_) => Ok(Incident {
                id: conn.last_insert_rowid(),
                monitor_id,
                state: IncidentState::Ongoing,
                cause: Some(cause.to_string()),
                started_at,
                resolved_at: None,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(DbError::Conflict(format!(
                    "monitor {} already has an ongoing incident",
                    monitor_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Mark an incident resolved and return its updated record.
    pub fn resolve_incident(&self, id: i64, resolved_at: DateTime<Utc>) -> Result<Incident, DbError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE incidents SET state = ?1, resolved_at = ?2 WHERE id = ?3 AND state = ?4",
            params![
                IncidentState::Resolved.as_str(),
                format_time(&resolved_at),
                id,
                IncidentState::Ongoing.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }

        let incident = conn.query_row(
            &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
            params![id],
            incident_from_row,
        )?;
        Ok(incident)
    }

    /// Every incident for a monitor, oldest first.
    #[cfg(test)]
    pub fn get_incidents(&self, monitor_id: i64) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE monitor_id = ?1 ORDER BY id ASC"
        ))?;
        let incidents = stmt
            .query_map(params![monitor_id], incident_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(incidents)
    }

    // --- Alert channels & history ---

    #[cfg(test)]
    pub fn add_alert_channel(
        &self,
        user_id: i64,
        kind: ChannelKind,
        config: &serde_json::Value,
    ) -> Result<AlertChannel, DbError> {
        let config_map = config.as_object().cloned().unwrap_or_default();
        let config_text = serde_json::to_string(&config_map)?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alert_channels (user_id, kind, config, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, kind.as_str(), config_text, format_time(&Utc::now())],
        )?;

        Ok(AlertChannel {
            id: conn.last_insert_rowid(),
            user_id,
            kind,
            config: config_map,
        })
    }

    /// All channels owned by a user.
    pub fn get_alert_channels(&self, user_id: i64) -> Result<Vec<AlertChannel>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, kind, config FROM alert_channels WHERE user_id = ?1 ORDER BY id",
        )?;
        let channels = stmt
            .query_map(params![user_id], |row| {
                let id: i64 = row.get(0)?;
                let kind: String = row.get(2)?;
                let config: String = row.get(3)?;
                let config = serde_json::from_str(&config).unwrap_or_else(|e| {
                    tracing::warn!("Store: Alert channel {} has malformed config: {}", id, e);
                    serde_json::Map::new()
                });
                Ok(AlertChannel {
                    id,
                    user_id: row.get(1)?,
                    kind: kind.parse::<ChannelKind>().map_err(|e| conversion_error(2, e))?,
                    config,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(channels)
    }

    pub fn add_alert_history(&self, entry: &NewAlertHistory) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alert_history (monitor_id, channel_id, incident_id, message, status, sent_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.monitor_id,
                entry.channel_id,
                entry.incident_id,
                entry.message,
                entry.status.as_str(),
                format_time(&Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[cfg(test)]
    pub fn get_alert_history(&self, monitor_id: i64) -> Result<Vec<AlertHistory>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, monitor_id, channel_id, incident_id, message, status, sent_at \
             FROM alert_history WHERE monitor_id = ?1 ORDER BY id ASC",
        )?;
        let history = stmt
            .query_map(params![monitor_id], |row| {
                let status: String = row.get(5)?;
                Ok(AlertHistory {
                    id: row.get(0)?,
                    monitor_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    incident_id: row.get(3)?,
                    message: row.get(4)?,
                    status: status.parse::<AlertStatus>().map_err(|e| conversion_error(5, e))?,
                    sent_at: time_column(row, 6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(history)
    }
}

fn monitor_from_row(row: &Row<'_>) -> SqlResult<Monitor> {
    let id: i64 = row.get(0)?;
    let headers: Option<String> = row.get(5)?;
    let headers = match headers {
        Some(text) if !text.is_empty() => match serde_json::from_str::<HashMap<String, String>>(&text) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!("Store: Ignoring malformed headers of monitor {}: {}", id, e);
                None
            }
        },
        _ => None,
    };

    Ok(Monitor {
        id,
        user_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        method: row.get(4)?,
        headers,
        body: row.get(6)?,
        expected_status: row.get(7)?,
        check_interval_seconds: row.get(8)?,
        timeout_ms: row.get(9)?,
        is_active: row.get(10)?,
        created_at: time_column(row, 11)?,
        updated_at: time_column(row, 12)?,
    })
}

fn check_from_row(row: &Row<'_>) -> SqlResult<Check> {
    Ok(Check {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        status_code: row.get(2)?,
        response_time_ms: row.get(3)?,
        is_up: row.get(4)?,
        error_message: row.get(5)?,
        response_body: row.get(6)?,
        region: row.get(7)?,
        checked_at: time_column(row, 8)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    let state: String = row.get(2)?;
    let resolved_at: Option<String> = row.get(5)?;
    Ok(Incident {
        id: row.get(0)?,
        monitor_id: row.get(1)?,
        state: state.parse::<IncidentState>().map_err(|e| conversion_error(2, e))?,
        cause: row.get(3)?,
        started_at: time_column(row, 4)?,
        resolved_at: resolved_at.as_deref().and_then(parse_db_time),
    })
}

#[cfg(test)]
fn encode_headers(headers: &Option<HashMap<String, String>>) -> Result<Option<String>, DbError> {
    Ok(match headers {
        Some(h) => Some(serde_json::to_string(h)?),
        None => None,
    })
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    Ok(parse_db_time(&text).unwrap_or_else(Utc::now))
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
