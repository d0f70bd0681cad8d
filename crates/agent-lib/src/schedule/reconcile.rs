//! Folding out-of-band registry edits into the bucket table

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{Placement, Scheduler};
use crate::health::components;
use crate::models::Device;

/// Settings for [`Reconciler`]
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Time between periodic passes
    pub interval: Duration,
    /// Read dirty records on every pass even when nothing in-process raised the flag
    pub poll_registry: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            poll_registry: true,
        }
    }
}

/// What one pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Dirty records applied to the buckets
    pub applied: usize,
    /// Devices that were not in any bucket before
    pub inserted: usize,
    /// Devices that changed interval bucket
    pub moved: usize,
    pub drivers_started: usize,
}

/// Background task that applies dirty registry records
pub struct Reconciler {
    scheduler: Scheduler,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(scheduler: Scheduler, config: ReconcileConfig) -> Self {
        Self { scheduler, config }
    }

    /// Reconcile periodically and on demand until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            poll_registry = self.config.poll_registry,
            "Starting reconciliation loop"
        );
        let health = &self.scheduler.context().health;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; startup already loaded everything
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.scheduler.reconcile_requested() => {
                    debug!("Reconciliation requested");
                }
                _ = shutdown.recv() => {
                    info!("Reconciliation loop shutting down");
                    break;
                }
            }

            match self.reconcile_once().await {
                Ok(_) => health.mark_healthy(components::RECONCILER),
                Err(err) => {
                    warn!(error = %err, "Reconciliation failed, will retry");
                    health.mark_degraded(components::RECONCILER, err.to_string());
                }
            }
        }
    }

    /// Run one pass
    ///
    /// The dirty flag is consumed up front and put back on any failure so
    /// the next pass retries.
    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome> {
        let flagged = self.scheduler.take_dirty();
        if !flagged && !self.config.poll_registry {
            return Ok(ReconcileOutcome::default());
        }

        match self.apply_dirty().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if flagged {
                    self.scheduler.restore_dirty();
                }
                self.scheduler.context().metrics.inc_reconcile("failed");
                Err(err)
            }
        }
    }

    async fn apply_dirty(&self) -> Result<ReconcileOutcome> {
        let ctx = self.scheduler.context();

        let mut outcome = ReconcileOutcome::default();
        let mut newcomers: Vec<Device> = Vec::new();
        let mut renamed: Vec<(Device, Device)> = Vec::new();
        let dirty = {
            // commands write the registry before taking this lock, so their
            // bucket update always lands after a snapshot read under it
            let mut state = self.scheduler.lock().await;
            let dirty = ctx
                .registry
                .list_dirty()
                .await
                .context("failed to list dirty devices")?;

            for device in &dirty {
                match state.buckets.upsert(device.clone()) {
                    Placement::Inserted => {
                        outcome.inserted += 1;
                        ctx.status.seed(&device.id, &device.address);
                        newcomers.push(device.clone());
                    }
                    Placement::Moved { from, previous } => {
                        debug!(
                            device_id = %device.id,
                            from_secs = from,
                            to_secs = device.interval_secs,
                            "Moved device between buckets"
                        );
                        outcome.moved += 1;
                        if previous.name != device.name {
                            renamed.push((previous, device.clone()));
                        }
                    }
                    Placement::Refreshed { previous } => {
                        if previous.name != device.name {
                            renamed.push((previous, device.clone()));
                        }
                    }
                }
                outcome.applied += 1;
            }
            outcome.drivers_started = self.scheduler.ensure_drivers(&mut state);
            dirty
        };

        for device in &newcomers {
            if let Err(err) = ctx
                .gateway
                .connect_device(&device.name, &ctx.device_profile)
                .await
            {
                warn!(device = %device.name, error = %err, "Failed to connect device on gateway");
            }
        }
        for (previous, current) in &renamed {
            if let Err(err) = ctx.gateway.disconnect_device(&previous.name).await {
                warn!(device = %previous.name, error = %err, "Failed to disconnect renamed device");
            }
            if let Err(err) = ctx
                .gateway
                .connect_device(&current.name, &ctx.device_profile)
                .await
            {
                warn!(device = %current.name, error = %err, "Failed to connect renamed device");
            }
        }

        if !dirty.is_empty() {
            let cleared = ctx
                .registry
                .clear_dirty(&dirty)
                .await
                .context("failed to clear dirty flags")?;
            if cleared < dirty.len() {
                debug!(
                    cleared = cleared,
                    pending = dirty.len() - cleared,
                    "Some devices changed again during the pass"
                );
            }
            ctx.logger.log_reconcile(
                outcome.applied,
                outcome.inserted,
                outcome.moved,
                outcome.drivers_started,
            );
            ctx.metrics.inc_reconcile("applied");
        } else {
            ctx.metrics.inc_reconcile("clean");
        }

        Ok(outcome)
    }
}
