//! Device event log repository

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::DbPool;
use crate::{Error, Result};

/// A logged device event
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Unique event ID
    pub id: String,

    /// Device that emitted the event
    pub device_id: String,

    /// Event type tag (e.g., "battery_low")
    pub event_type: String,

    /// Event payload as sent by the device
    pub data: serde_json::Value,

    /// Device-reported timestamp (epoch milliseconds)
    pub timestamp: i64,

    /// When the gateway recorded the event
    pub created_at: DateTime<Utc>,
}

/// Event log repository
#[derive(Clone)]
pub struct EventLogRepo {
    pool: DbPool,
}

impl EventLogRepo {
    /// Create a new event log repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record an event emitted by a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(
        &self,
        device_id: &str,
        event_type: &str,
        data: &serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO device_events (id, device_id, event_type, data, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![id, device_id, event_type, data.to_string(), timestamp, now],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Fetch the most recent events for a device, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recent(&self, device_id: &str, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, device_id, event_type, data, timestamp, created_at
                 FROM device_events WHERE device_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let events = stmt
            .query_map(rusqlite::params![device_id, limit], |row| {
                Ok(EventRecord {
                    id: row.get(0)?,
                    device_id: row.get(1)?,
                    event_type: row.get(2)?,
                    data: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: row.get(4)?,
                    created_at: parse_datetime(&row.get::<_, String>(5)?),
                })
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(events)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
