//! Interval-bucketed probe scheduling
//!
//! Devices are grouped into buckets by probe interval. Each bucket gets
//! one [`CycleDriver`] task that probes the whole bucket once per period.
//! The [`Reconciler`] folds out-of-band registry edits back into the
//! buckets, and the command path mutates them directly.
//!
//! All bucket mutations and driver starts happen under the single
//! [`Scheduler`] lock, so "is there a driver for this interval" and "put a
//! device in this interval" can never interleave badly.

mod buckets;
mod driver;
mod reconcile;


pub use buckets::{Bucket, PeriodBucketTable, Placement};
pub use driver::{next_tick, CycleDriver, CycleReport, NextTick, Wait};
pub use reconcile::{ReconcileConfig, ReconcileOutcome, Reconciler};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::gateway::Gateway;
use crate::health::HealthRegistry;
use crate::models::Device;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::probe::Prober;
use crate::registry::DeviceRegistry;
use crate::status::OnlineStatusMap;

/// Collaborators shared by drivers, the reconciler and the command path
#[derive(Clone)]
pub struct ProbeContext {
    pub registry: Arc<dyn DeviceRegistry>,
    pub prober: Arc<dyn Prober>,
    pub gateway: Arc<dyn Gateway>,
    pub status: Arc<OnlineStatusMap>,
    pub health: HealthRegistry,
    pub metrics: AgentMetrics,
    pub logger: StructuredLogger,
    /// Device type announced when connecting devices on the gateway
    pub device_profile: String,
}

/// Buckets plus the driver task running for each interval
#[derive(Default)]
pub struct SchedulerState {
    pub buckets: PeriodBucketTable,
    drivers: HashMap<u64, JoinHandle<()>>,
}

impl SchedulerState {
    /// True while the interval's driver task is alive
    ///
    /// A driver that gave up on an unusable probe mechanism stays registered,
    /// so the interval is not restarted, but it no longer counts as running.
    pub fn has_driver(&self, interval_secs: u64) -> bool {
        self.drivers
            .get(&interval_secs)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn driver_intervals(&self) -> Vec<u64> {
        let mut intervals: Vec<u64> = self.drivers.keys().copied().collect();
        intervals.sort_unstable();
        intervals
    }
}

/// Per-bucket summary exposed over the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct BucketSummary {
    pub interval_secs: u64,
    pub devices: usize,
    pub driver_running: bool,
}

struct Inner {
    state: Mutex<SchedulerState>,
    ctx: ProbeContext,
    shutdown: broadcast::Sender<()>,
    dirty: AtomicBool,
    wake: Notify,
}

/// Shared handle to the bucket table and its drivers
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(ctx: ProbeContext, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                ctx,
                shutdown,
                dirty: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    pub fn context(&self) -> &ProbeContext {
        &self.inner.ctx
    }

    /// Exclusive access to buckets and drivers
    pub async fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().await
    }

    /// Place devices into buckets and start any missing drivers
    ///
    /// Returns the number of drivers started.
    pub async fn load(&self, devices: impl IntoIterator<Item = Device>) -> usize {
        let mut state = self.lock().await;
        for device in devices {
            self.inner.ctx.status.seed(&device.id, &device.address);
            state.buckets.upsert(device);
        }
        self.ensure_drivers(&mut state)
    }

    /// Start a driver for every interval key that lacks one
    ///
    /// Takes the locked state so callers mutate buckets and start drivers
    /// inside one critical section.
    pub fn ensure_drivers(&self, state: &mut SchedulerState) -> usize {
        let mut started = 0;
        for interval_secs in state.buckets.intervals() {
            if state.drivers.contains_key(&interval_secs) {
                continue;
            }
            let driver = CycleDriver::new(interval_secs, self.clone());
            let handle = tokio::spawn(driver.run(self.inner.shutdown.subscribe()));
            state.drivers.insert(interval_secs, handle);
            started += 1;
            info!(interval_secs = interval_secs, "Started cycle driver");
        }
        self.inner
            .ctx
            .metrics
            .set_schedule_size(state.buckets.device_count(), state.drivers.len());
        started
    }

    /// Copy of one bucket's devices
    pub async fn snapshot(&self, interval_secs: u64) -> Vec<Device> {
        self.lock().await.buckets.snapshot(interval_secs)
    }

    pub async fn intervals(&self) -> Vec<u64> {
        self.lock().await.buckets.intervals()
    }

    pub async fn driver_intervals(&self) -> Vec<u64> {
        self.lock().await.driver_intervals()
    }

    /// Interval bucket currently holding `id`
    pub async fn locate(&self, id: &str) -> Option<u64> {
        self.lock().await.buckets.locate(id)
    }

    pub async fn all_devices(&self) -> Vec<Device> {
        self.lock().await.buckets.all_devices()
    }

    pub async fn summary(&self) -> Vec<BucketSummary> {
        let state = self.lock().await;
        state
            .buckets
            .intervals()
            .into_iter()
            .map(|interval_secs| BucketSummary {
                interval_secs,
                devices: state.buckets.bucket(interval_secs).map(Bucket::len).unwrap_or(0),
                driver_running: state.has_driver(interval_secs),
            })
            .collect()
    }

    /// Flag that the registry holds changes the buckets have not seen, and wake the reconciler
    pub fn mark_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Consume the dirty flag
    pub(crate) fn take_dirty(&self) -> bool {
        self.inner.dirty.swap(false, Ordering::SeqCst)
    }

    /// Put the flag back after a failed pass without waking anyone
    pub(crate) fn restore_dirty(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
    }

    /// Resolves when the command path asks for an immediate pass
    pub async fn reconcile_requested(&self) {
        self.inner.wake.notified().await;
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.inner.shutdown.subscribe()
    }
}
