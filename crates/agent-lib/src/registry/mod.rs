//! Persistent device registry
//!
//! The registry is the source of truth for which devices exist, their
//! addresses and their probe intervals. Out-of-band edits mark records
//! dirty so the scheduler can pick them up during reconciliation.

mod memory;
mod sqlite;


pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{RegistryError, RegistryResult};
use crate::models::{check_interval, Device, DeviceUpdate, NewDevice};

/// Storage operations the agent and CLI need over the device set
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn list_all(&self) -> RegistryResult<Vec<Device>>;

    async fn list_by_interval(&self, interval_secs: u64) -> RegistryResult<Vec<Device>>;

    /// Distinct probe intervals currently in use, ascending
    async fn list_distinct_intervals(&self) -> RegistryResult<Vec<u64>>;

    async fn list_dirty(&self) -> RegistryResult<Vec<Device>>;

    async fn get_by_id(&self, id: &str) -> RegistryResult<Option<Device>>;

    async fn get_by_name(&self, name: &str) -> RegistryResult<Option<Device>>;

    /// Insert a device; `dirty` controls whether reconciliation should pick it up
    async fn create(&self, device: NewDevice, dirty: bool) -> RegistryResult<Device>;

    /// Change the probe interval, remembering the old one and marking the record dirty
    async fn update_interval(&self, id: &str, interval_secs: u64) -> RegistryResult<Device>;

    /// Change identity fields; the record's dirty flag is left as is
    async fn update_fields(&self, id: &str, update: &DeviceUpdate) -> RegistryResult<Device>;

    async fn delete(&self, id: &str) -> RegistryResult<()>;

    /// Clear the dirty flag on records that have not changed since `reconciled` was read
    async fn clear_dirty(&self, reconciled: &[Device]) -> RegistryResult<usize>;

    /// Stamp `last_seen` on devices that answered a probe
    async fn record_seen(&self, ids: &[String], at: DateTime<Utc>) -> RegistryResult<()>;
}

/// Column value for a probe interval the scheduler can run
pub(crate) fn stored_interval(interval_secs: u64) -> RegistryResult<i64> {
    check_interval(interval_secs).map_err(RegistryError::Invalid)?;
    i64::try_from(interval_secs).map_err(|e| RegistryError::Invalid(e.to_string()))
}
