//! In-process registry used by tests and dry runs

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{stored_interval, DeviceRegistry};
use crate::error::{RegistryError, RegistryResult};
use crate::models::{Device, DeviceUpdate, NewDevice};

/// Device registry held entirely in memory
///
/// `set_unavailable(true)` makes every call fail, which lets callers
/// exercise their storage-outage paths.
#[derive(Default)]
pub struct MemoryRegistry {
    devices: DashMap<String, Device>,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated with clean (non-dirty) records
    pub fn with_devices(devices: impl IntoIterator<Item = NewDevice>) -> Self {
        let registry = Self::new();
        for device in devices {
            let record = record_from(device, false);
            registry.devices.insert(record.id.clone(), record);
        }
        registry
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> RegistryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry offline".into()));
        }
        Ok(())
    }

    fn sorted(&self, keep: impl Fn(&Device) -> bool) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    fn name_taken(&self, name: &str, except_id: &str) -> bool {
        self.devices
            .iter()
            .any(|entry| entry.name == name && entry.id != except_id)
    }
}

fn record_from(device: NewDevice, dirty: bool) -> Device {
    Device {
        id: device.id,
        name: device.name,
        address: device.address,
        interval_secs: device.interval_secs,
        prev_interval_secs: device.interval_secs,
        dirty,
        last_seen: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn list_all(&self) -> RegistryResult<Vec<Device>> {
        self.check()?;
        Ok(self.sorted(|_| true))
    }

    async fn list_by_interval(&self, interval_secs: u64) -> RegistryResult<Vec<Device>> {
        self.check()?;
        Ok(self.sorted(|d| d.interval_secs == interval_secs))
    }

    async fn list_distinct_intervals(&self) -> RegistryResult<Vec<u64>> {
        self.check()?;
        let mut intervals: Vec<u64> = self.devices.iter().map(|d| d.interval_secs).collect();
        intervals.sort_unstable();
        intervals.dedup();
        Ok(intervals)
    }

    async fn list_dirty(&self) -> RegistryResult<Vec<Device>> {
        self.check()?;
        Ok(self.sorted(|d| d.dirty))
    }

    async fn get_by_id(&self, id: &str) -> RegistryResult<Option<Device>> {
        self.check()?;
        Ok(self.devices.get(id).map(|d| d.clone()))
    }

    async fn get_by_name(&self, name: &str) -> RegistryResult<Option<Device>> {
        self.check()?;
        Ok(self
            .devices
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value().clone()))
    }

    async fn create(&self, device: NewDevice, dirty: bool) -> RegistryResult<Device> {
        self.check()?;
        stored_interval(device.interval_secs)?;
        if self.devices.contains_key(&device.id) {
            return Err(RegistryError::Conflict(device.id));
        }
        if self.name_taken(&device.name, &device.id) {
            return Err(RegistryError::Conflict(device.name));
        }
        let record = record_from(device, dirty);
        self.devices.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_interval(&self, id: &str, interval_secs: u64) -> RegistryResult<Device> {
        self.check()?;
        stored_interval(interval_secs)?;
        let mut entry = self
            .devices
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.prev_interval_secs = entry.interval_secs;
        entry.interval_secs = interval_secs;
        entry.dirty = true;
        entry.updated_at = Some(Utc::now());
        Ok(entry.clone())
    }

    async fn update_fields(&self, id: &str, update: &DeviceUpdate) -> RegistryResult<Device> {
        self.check()?;
        let current = self
            .devices
            .get(id)
            .map(|d| d.clone())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let mut merged = update.merge_into(&current);
        merged.updated_at = Some(Utc::now());

        if merged.id != current.id && self.devices.contains_key(&merged.id) {
            return Err(RegistryError::Conflict(merged.id));
        }
        if self.name_taken(&merged.name, &current.id) {
            return Err(RegistryError::Conflict(merged.name));
        }

        self.devices.remove(&current.id);
        self.devices.insert(merged.id.clone(), merged.clone());
        Ok(merged)
    }

    async fn delete(&self, id: &str) -> RegistryResult<()> {
        self.check()?;
        self.devices
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn clear_dirty(&self, reconciled: &[Device]) -> RegistryResult<usize> {
        self.check()?;
        let mut cleared = 0;
        for device in reconciled {
            if let Some(mut entry) = self.devices.get_mut(&device.id) {
                if entry.updated_at == device.updated_at && entry.dirty {
                    entry.dirty = false;
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }

    async fn record_seen(&self, ids: &[String], at: DateTime<Utc>) -> RegistryResult<()> {
        self.check()?;
        for id in ids {
            if let Some(mut entry) = self.devices.get_mut(id) {
                entry.last_seen = Some(at);
            }
        }
        Ok(())
    }
}
