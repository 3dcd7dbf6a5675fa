//! Device record repository
//!
//! Owns the persisted view of every device the gateway has ever seen.
//! Approval status only changes through [`DeviceRepo::set_status`]; profile
//! upserts leave it untouched.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::DbPool;
use crate::broker::{ApprovalStatus, DeviceProfile};
use crate::{Error, Result};

/// A persisted device record
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// Stable, device-chosen identifier
    pub id: String,

    /// Human-readable device name
    pub name: String,

    /// Hardware model (e.g., "Pixel 8")
    pub model: String,

    /// Hardware manufacturer (e.g., "Google")
    pub manufacturer: String,

    /// Platform tag ("android" or "ios")
    pub platform: String,

    /// OS version string
    pub os_version: String,

    /// Client app version string
    pub app_version: String,

    /// Approval status gating command dispatch
    pub status: ApprovalStatus,

    /// When the device first authenticated
    pub first_seen: DateTime<Utc>,

    /// When the device last authenticated or disconnected
    pub last_seen: DateTime<Utc>,

    /// Cached extended info blob from the last `get_device_info` fetch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extended_info: Option<serde_json::Value>,
}

/// Device repository
#[derive(Clone)]
pub struct DeviceRepo {
    pool: DbPool,
}

impl DeviceRepo {
    /// Create a new device repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a new device or update an existing one's profile fields
    ///
    /// Never touches the status column: an unseen device starts `pending`,
    /// a known device keeps whatever status it already has.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, profile: &DeviceProfile) -> Result<DeviceRecord> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO devices (id, name, model, manufacturer, platform, os_version, app_version, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 name = ?2, model = ?3, manufacturer = ?4, platform = ?5,
                 os_version = ?6, app_version = ?7, last_seen = ?8",
            rusqlite::params![
                profile.device_id,
                profile.device_name,
                profile.model,
                profile.manufacturer,
                profile.platform.to_string(),
                profile.os_version,
                profile.app_version,
                now,
            ],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        self.find(&profile.device_id)?
            .ok_or_else(|| Error::Database("device row missing after upsert".to_string()))
    }

    /// Find a device by ID (returns None if not found)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let result = conn.query_row(
            "SELECT id, name, model, manufacturer, platform, os_version, app_version,
                    status, first_seen, last_seen, extended_info
             FROM devices WHERE id = ?1",
            [device_id],
            map_device_row,
        );

        match result {
            Ok(device) => Ok(Some(device)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// List all devices, most recently seen first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, name, model, manufacturer, platform, os_version, app_version,
                        status, first_seen, last_seen, extended_info
                 FROM devices ORDER BY last_seen DESC",
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        let devices = stmt
            .query_map([], map_device_row)
            .map_err(|e| Error::Database(e.to_string()))?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(devices)
    }

    /// Set a device's approval status
    ///
    /// Returns false if the device id is unknown.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_status(&self, device_id: &str, status: ApprovalStatus) -> Result<bool> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let rows = conn
            .execute(
                "UPDATE devices SET status = ?1 WHERE id = ?2",
                [&status.to_string(), device_id],
            )
            .map_err(|e| Error::Database(e.to_string()))?;

        if rows > 0 {
            tracing::info!(device_id, %status, "device status updated");
        }

        Ok(rows > 0)
    }

    /// Cache an extended-info blob for a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn set_extended_info(&self, device_id: &str, info: &serde_json::Value) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        conn.execute(
            "UPDATE devices SET extended_info = ?1 WHERE id = ?2",
            [&info.to_string(), device_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }

    /// Update last-seen timestamp for a device
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn touch_last_seen(&self, device_id: &str) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| Error::Database(e.to_string()))?;

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE devices SET last_seen = ?1 WHERE id = ?2",
            [&now, device_id],
        )
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(())
    }
}

fn map_device_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        model: row.get(2)?,
        manufacturer: row.get(3)?,
        platform: row.get(4)?,
        os_version: row.get(5)?,
        app_version: row.get(6)?,
        status: ApprovalStatus::from_str(&row.get::<_, String>(7)?),
        first_seen: parse_datetime(&row.get::<_, String>(8)?),
        last_seen: parse_datetime(&row.get::<_, String>(9)?),
        extended_info: row
            .get::<_, Option<String>>(10)?
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
