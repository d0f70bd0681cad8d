//! SQLite-backed device registry

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};

use super::{stored_interval, DeviceRegistry};
use crate::error::{RegistryError, RegistryResult};
use crate::models::{Device, DeviceUpdate, NewDevice};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    address TEXT NOT NULL,
    interval_secs INTEGER NOT NULL DEFAULT 60,
    prev_interval_secs INTEGER NOT NULL DEFAULT 60,
    dirty INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_devices_interval ON devices(interval_secs);
CREATE INDEX IF NOT EXISTS idx_devices_dirty ON devices(dirty);
"#;

/// The CLI and the agent may hold the file open at the same time
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DEVICE_COLUMNS: &str =
    "id, name, address, interval_secs, prev_interval_secs, dirty, last_seen, created_at, updated_at";

/// Device registry persisted in a single SQLite file
///
/// rusqlite is blocking, so every call hops onto the blocking pool while
/// holding the connection mutex.
#[derive(Clone)]
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    /// Open (or create) the registry at `path` and apply the schema
    pub async fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> RegistryResult<Connection> {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(SCHEMA)?;
            info!(path = %path.display(), "Opened device registry");
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Registry backed by a private in-memory database
    pub fn open_in_memory() -> RegistryResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> RegistryResult<T>
    where
        F: FnOnce(&mut Connection) -> RegistryResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RegistryError::Unavailable("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }
}

/// Interval columns are signed in SQLite; negative values are corrupt rows
fn interval_column(row: &Row<'_>, index: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(index)?;
    u64::try_from(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Integer, Box::new(e)))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        interval_secs: interval_column(row, 3)?,
        prev_interval_secs: interval_column(row, 4)?,
        dirty: row.get(5)?,
        last_seen: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Map unique-key violations to a conflict naming the offending record
fn classify(err: rusqlite::Error, subject: &str) -> RegistryError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            RegistryError::Conflict(subject.to_string())
        }
        _ => RegistryError::Storage(err),
    }
}

fn query_devices(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> RegistryResult<Vec<Device>> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, device_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn fetch_by_id(conn: &Connection, id: &str) -> RegistryResult<Option<Device>> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![id], device_from_row)
        .optional()?)
}

#[async_trait]
impl DeviceRegistry for SqliteRegistry {
    async fn list_all(&self) -> RegistryResult<Vec<Device>> {
        self.with_conn(|conn| query_devices(conn, "ORDER BY name", []))
            .await
    }

    async fn list_by_interval(&self, interval_secs: u64) -> RegistryResult<Vec<Device>> {
        // nothing wider than a signed column can be stored
        let Ok(interval_secs) = i64::try_from(interval_secs) else {
            return Ok(Vec::new());
        };
        self.with_conn(move |conn| {
            query_devices(
                conn,
                "WHERE interval_secs = ?1 ORDER BY name",
                params![interval_secs],
            )
        })
        .await
    }

    async fn list_distinct_intervals(&self) -> RegistryResult<Vec<u64>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT interval_secs FROM devices ORDER BY interval_secs")?;
            let rows = stmt.query_map([], |row| interval_column(row, 0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn list_dirty(&self) -> RegistryResult<Vec<Device>> {
        self.with_conn(|conn| query_devices(conn, "WHERE dirty = 1 ORDER BY name", []))
            .await
    }

    async fn get_by_id(&self, id: &str) -> RegistryResult<Option<Device>> {
        let id = id.to_string();
        self.with_conn(move |conn| fetch_by_id(conn, &id)).await
    }

    async fn get_by_name(&self, name: &str) -> RegistryResult<Option<Device>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE name = ?1");
            Ok(conn
                .query_row(&sql, params![name], device_from_row)
                .optional()?)
        })
        .await
    }

    async fn create(&self, device: NewDevice, dirty: bool) -> RegistryResult<Device> {
        let interval = stored_interval(device.interval_secs)?;
        self.with_conn(move |conn| {
            let record = Device {
                id: device.id,
                name: device.name,
                address: device.address,
                interval_secs: device.interval_secs,
                prev_interval_secs: device.interval_secs,
                dirty,
                last_seen: None,
                created_at: Utc::now(),
                updated_at: None,
            };
            conn.execute(
                "INSERT INTO devices (id, name, address, interval_secs, prev_interval_secs, dirty, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id,
                    record.name,
                    record.address,
                    interval,
                    interval,
                    record.dirty,
                    record.created_at,
                ],
            )
            .map_err(|e| classify(e, &record.name))?;
            debug!(device_id = %record.id, name = %record.name, dirty, "Created device");
            Ok(record)
        })
        .await
    }

    async fn update_interval(&self, id: &str, interval_secs: u64) -> RegistryResult<Device> {
        let interval = stored_interval(interval_secs)?;
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE devices
                 SET prev_interval_secs = interval_secs, interval_secs = ?1, dirty = 1, updated_at = ?2
                 WHERE id = ?3",
                params![interval, Utc::now(), id],
            )?;
            if changed == 0 {
                return Err(RegistryError::NotFound(id));
            }
            let device = fetch_by_id(&tx, &id)?.ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            tx.commit()?;
            Ok(device)
        })
        .await
    }

    async fn update_fields(&self, id: &str, update: &DeviceUpdate) -> RegistryResult<Device> {
        let id = id.to_string();
        let update = update.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current = fetch_by_id(&tx, &id)?.ok_or_else(|| RegistryError::NotFound(id.clone()))?;
            let mut merged = update.merge_into(&current);
            merged.updated_at = Some(Utc::now());
            tx.execute(
                "UPDATE devices SET id = ?1, name = ?2, address = ?3, updated_at = ?4 WHERE id = ?5",
                params![merged.id, merged.name, merged.address, merged.updated_at, id],
            )
            .map_err(|e| classify(e, &merged.id))?;
            tx.commit()?;
            Ok(merged)
        })
        .await
    }

    async fn delete(&self, id: &str) -> RegistryResult<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
            if removed == 0 {
                return Err(RegistryError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn clear_dirty(&self, reconciled: &[Device]) -> RegistryResult<usize> {
        let marks: Vec<(String, Option<DateTime<Utc>>)> = reconciled
            .iter()
            .map(|d| (d.id.clone(), d.updated_at))
            .collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut cleared = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE devices SET dirty = 0 WHERE id = ?1 AND dirty = 1 AND updated_at IS ?2",
                )?;
                for (id, updated_at) in &marks {
                    cleared += stmt.execute(params![id, updated_at])?;
                }
            }
            tx.commit()?;
            Ok(cleared)
        })
        .await
    }

    async fn record_seen(&self, ids: &[String], at: DateTime<Utc>) -> RegistryResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE devices SET last_seen = ?1 WHERE id = ?2")?;
                for id in &ids {
                    stmt.execute(params![at, id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
