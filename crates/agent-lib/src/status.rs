//! Latest known liveness per device
//!
//! Written by the cycle drivers and read by the aggregate reporter. Entries
//! are keyed by device id so two devices sharing an address stay distinct.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::models::{Device, FleetTotals, Liveness};

/// One device's most recent observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub address: String,
    pub liveness: Liveness,
    /// `None` until the first probe of this device completes
    pub observed_at: Option<DateTime<Utc>>,
}

/// Concurrent map from device id to last observed liveness
#[derive(Debug, Default)]
pub struct OnlineStatusMap {
    entries: DashMap<String, StatusEntry>,
}

impl OnlineStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map with every device recorded as down
    pub fn seeded<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Self {
        let map = Self::new();
        for device in devices {
            map.seed(&device.id, &device.address);
        }
        map
    }

    /// Add a device as down unless it already has an entry
    pub fn seed(&self, id: &str, address: &str) {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| StatusEntry {
                address: address.to_string(),
                liveness: Liveness::Down,
                observed_at: None,
            });
    }

    /// Overwrite a device's entry with a fresh probe result
    pub fn record(&self, id: &str, address: &str, liveness: Liveness, at: DateTime<Utc>) {
        self.entries.insert(
            id.to_string(),
            StatusEntry {
                address: address.to_string(),
                liveness,
                observed_at: Some(at),
            },
        );
    }

    /// Update a tracked device; returns false (and does nothing) for unknown ids
    ///
    /// Drivers use this so a device deleted mid-cycle is not resurrected.
    pub fn refresh(&self, id: &str, address: &str, liveness: Liveness, at: DateTime<Utc>) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                entry.address = address.to_string();
                entry.liveness = liveness;
                entry.observed_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &str) -> Option<StatusEntry> {
        self.entries.remove(id).map(|(_, entry)| entry)
    }

    /// Carry an entry over to a device's new id and address
    pub fn rekey(&self, old_id: &str, new_id: &str, address: &str) {
        let entry = self.remove(old_id).map(|mut entry| {
            entry.address = address.to_string();
            entry
        });
        match entry {
            Some(entry) => {
                self.entries.insert(new_id.to_string(), entry);
            }
            None => self.seed(new_id, address),
        }
    }

    pub fn get(&self, id: &str) -> Option<StatusEntry> {
        self.entries.get(id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count devices by state; `total` always equals `online + offline`
    pub fn totals(&self) -> FleetTotals {
        let mut totals = FleetTotals::default();
        for entry in self.entries.iter() {
            totals.total += 1;
            if entry.liveness.is_up() {
                totals.online += 1;
            } else {
                totals.offline += 1;
            }
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_does_not_overwrite_observations() {
        let map = OnlineStatusMap::new();
        map.record("cam-1", "10.0.0.5", Liveness::Up, Utc::now());
        map.seed("cam-1", "10.0.0.5");
        assert_eq!(map.get("cam-1").unwrap().liveness, Liveness::Up);
    }

    #[test]
    fn test_refresh_ignores_untracked_devices() {
        let map = OnlineStatusMap::new();
        assert!(!map.refresh("ghost", "10.0.0.1", Liveness::Up, Utc::now()));
        assert!(map.is_empty());

        map.seed("cam-1", "10.0.0.5");
        assert!(map.refresh("cam-1", "10.0.0.5", Liveness::Up, Utc::now()));
        assert_eq!(map.get("cam-1").unwrap().liveness, Liveness::Up);
    }

    #[test]
    fn test_shared_address_counts_twice() {
        let map = OnlineStatusMap::new();
        map.record("cam-1", "10.0.0.5", Liveness::Up, Utc::now());
        map.record("cam-2", "10.0.0.5", Liveness::Down, Utc::now());

        let totals = map.totals();
        assert_eq!(totals.total, 2);
        assert_eq!(totals.online, 1);
        assert_eq!(totals.offline, 1);
    }

    #[test]
    fn test_rekey_keeps_last_observation() {
        let map = OnlineStatusMap::new();
        map.record("cam-1", "10.0.0.5", Liveness::Up, Utc::now());
        map.rekey("cam-1", "cam-100", "10.0.0.50");

        assert!(map.get("cam-1").is_none());
        let entry = map.get("cam-100").unwrap();
        assert_eq!(entry.liveness, Liveness::Up);
        assert_eq!(entry.address, "10.0.0.50");
    }

    #[test]
    fn test_totals_balance() {
        let map = OnlineStatusMap::new();
        for i in 0..10 {
            let liveness = if i % 3 == 0 { Liveness::Up } else { Liveness::Down };
            map.record(&format!("cam-{i}"), "10.0.0.1", liveness, Utc::now());
        }
        map.remove("cam-0");

        let totals = map.totals();
        assert_eq!(totals.total, totals.online + totals.offline);
        assert_eq!(totals.total, 9);
        assert_eq!(totals.online, 3);
    }
}
