//! Interval-keyed grouping of devices
//!
//! Every device lives in exactly one bucket, the one keyed by its current
//! probe interval. A location index tracks which bucket holds each id so
//! moves never leave a stale copy behind.

use std::collections::{BTreeMap, HashMap};

use crate::models::Device;

/// Devices sharing one probe interval, keyed by id
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    devices: HashMap<String, Device>,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }
}

/// Where an upserted device ended up relative to where it was
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The device was not in any bucket before
    Inserted,
    /// The device was already in this interval's bucket and got refreshed
    Refreshed { previous: Device },
    /// The device moved from another interval's bucket
    Moved { from: u64, previous: Device },
}

impl Placement {
    pub fn previous(&self) -> Option<&Device> {
        match self {
            Placement::Inserted => None,
            Placement::Refreshed { previous } | Placement::Moved { previous, .. } => Some(previous),
        }
    }
}

/// Ordered map from interval seconds to the devices probed at that interval
#[derive(Debug, Default)]
pub struct PeriodBucketTable {
    buckets: BTreeMap<u64, Bucket>,
    locations: HashMap<String, u64>,
}

impl PeriodBucketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `device` in the bucket for its current interval
    ///
    /// Any existing copy is removed first. The location index covers the
    /// bucket named by `prev_interval_secs` as well as any bucket a
    /// superseded change left the device in.
    pub fn upsert(&mut self, device: Device) -> Placement {
        let interval = device.interval_secs;
        let placement = match self.take(&device.id) {
            None => Placement::Inserted,
            Some((from, previous)) if from == interval => Placement::Refreshed { previous },
            Some((from, previous)) => Placement::Moved { from, previous },
        };

        self.locations.insert(device.id.clone(), interval);
        self.buckets
            .entry(interval)
            .or_default()
            .devices
            .insert(device.id.clone(), device);
        placement
    }

    /// Remove `id` from the bucket keyed by `interval_secs`, if it is there
    ///
    /// The bucket itself is kept even when it becomes empty so its driver
    /// keeps ticking and picks up devices that move in later.
    pub fn remove(&mut self, id: &str, interval_secs: u64) -> Option<Device> {
        let bucket = self.buckets.get_mut(&interval_secs)?;
        let removed = bucket.devices.remove(id)?;
        self.locations.remove(id);
        Some(removed)
    }

    /// Remove `id` from whichever bucket holds it
    pub fn evict(&mut self, id: &str) -> Option<Device> {
        self.take(id).map(|(_, device)| device)
    }

    fn take(&mut self, id: &str) -> Option<(u64, Device)> {
        let interval = self.locations.remove(id)?;
        let device = self.buckets.get_mut(&interval)?.devices.remove(id)?;
        Some((interval, device))
    }

    /// Make sure a (possibly empty) bucket exists for `interval_secs`
    pub fn ensure_bucket(&mut self, interval_secs: u64) {
        self.buckets.entry(interval_secs).or_default();
    }

    /// Interval keys currently present, ascending
    pub fn intervals(&self) -> Vec<u64> {
        self.buckets.keys().copied().collect()
    }

    pub fn bucket(&self, interval_secs: u64) -> Option<&Bucket> {
        self.buckets.get(&interval_secs)
    }

    /// Copy of the devices in one bucket, ordered by name
    pub fn snapshot(&self, interval_secs: u64) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .buckets
            .get(&interval_secs)
            .map(|b| b.devices().cloned().collect())
            .unwrap_or_default();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Every scheduled device across all buckets
    pub fn all_devices(&self) -> Vec<Device> {
        self.buckets
            .values()
            .flat_map(|b| b.devices().cloned())
            .collect()
    }

    pub fn locate(&self, id: &str) -> Option<u64> {
        self.locations.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        let interval = self.locations.get(id)?;
        self.buckets.get(interval)?.get(id)
    }

    /// Look a device up by display name
    pub fn find_by_name(&self, name: &str) -> Option<&Device> {
        self.buckets
            .values()
            .flat_map(|b| b.devices())
            .find(|d| d.name == name)
    }

    /// Number of scheduled devices
    pub fn device_count(&self) -> usize {
        self.locations.len()
    }

    /// Number of buckets, including empty ones
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl FromIterator<Device> for PeriodBucketTable {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        let mut table = Self::new();
        for device in iter {
            table.upsert(device);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn device(id: &str, interval: u64) -> Device {
        Device {
            id: id.to_string(),
            name: format!("name-{id}"),
            address: format!("10.0.0.{}", id.len()),
            interval_secs: interval,
            prev_interval_secs: interval,
            dirty: false,
            last_seen: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn occurrences(table: &PeriodBucketTable, id: &str) -> usize {
        table
            .intervals()
            .into_iter()
            .filter(|i| table.bucket(*i).map(|b| b.contains(id)).unwrap_or(false))
            .count()
    }

    #[test]
    fn test_upsert_inserts_new_device() {
        let mut table = PeriodBucketTable::new();
        assert_eq!(table.upsert(device("a", 60)), Placement::Inserted);
        assert_eq!(table.locate("a"), Some(60));
        assert_eq!(table.device_count(), 1);
    }

    #[test]
    fn test_upsert_moves_between_buckets() {
        let mut table = PeriodBucketTable::new();
        table.upsert(device("a", 60));

        let mut moved = device("a", 30);
        moved.prev_interval_secs = 60;
        let placement = table.upsert(moved);

        assert!(matches!(placement, Placement::Moved { from: 60, .. }));
        assert_eq!(table.locate("a"), Some(30));
        assert_eq!(occurrences(&table, "a"), 1);
        // the vacated bucket stays so its driver keeps running
        assert!(table.bucket(60).unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_leaves_single_entry_in_original_bucket() {
        let mut table = PeriodBucketTable::new();
        table.upsert(device("a", 60));

        let mut away = device("a", 30);
        away.prev_interval_secs = 60;
        table.upsert(away);
        let mut back = device("a", 60);
        back.prev_interval_secs = 30;
        let placement = table.upsert(back);

        assert!(matches!(placement, Placement::Moved { from: 30, .. }));
        assert_eq!(occurrences(&table, "a"), 1);
        assert_eq!(table.locate("a"), Some(60));
        assert!(table.bucket(30).unwrap().is_empty());
        assert_eq!(table.bucket(60).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_previous_interval_cannot_duplicate() {
        let mut table = PeriodBucketTable::new();
        table.upsert(device("a", 60));

        // two interval changes land before reconciliation sees the first
        let mut latest = device("a", 15);
        latest.prev_interval_secs = 30;
        table.upsert(latest);

        assert_eq!(occurrences(&table, "a"), 1);
        assert_eq!(table.locate("a"), Some(15));
    }

    #[test]
    fn test_upsert_same_interval_refreshes_attributes() {
        let mut table = PeriodBucketTable::new();
        table.upsert(device("a", 60));

        let mut renamed = device("a", 60);
        renamed.address = "192.168.1.9".into();
        let placement = table.upsert(renamed);

        assert!(matches!(placement, Placement::Refreshed { .. }));
        assert_eq!(table.get("a").unwrap().address, "192.168.1.9");
        assert_eq!(table.bucket(60).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_only_touches_named_bucket() {
        let mut table = PeriodBucketTable::new();
        table.upsert(device("a", 60));

        assert!(table.remove("a", 30).is_none());
        assert_eq!(table.locate("a"), Some(60));
        assert!(table.remove("a", 60).is_some());
        assert_eq!(table.locate("a"), None);
        assert_eq!(table.device_count(), 0);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let mut table: PeriodBucketTable = vec![device("a", 60), device("b", 60)].into_iter().collect();
        let snapshot = table.snapshot(60);
        table.evict("a");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(table.snapshot(60).len(), 1);
        assert!(table.snapshot(999).is_empty());
    }

    #[test]
    fn test_intervals_are_ordered() {
        let table: PeriodBucketTable =
            vec![device("a", 300), device("b", 15), device("c", 60)].into_iter().collect();
        assert_eq!(table.intervals(), vec![15, 60, 300]);
        assert_eq!(table.find_by_name("name-c").unwrap().id, "c");
    }
}
