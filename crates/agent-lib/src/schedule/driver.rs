//! Periodic probing of one interval bucket

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use super::Scheduler;
use crate::error::ProbeError;
use crate::health::components;
use crate::models::{Device, Liveness, TelemetryPoint, MAX_INTERVAL_SECS};
use crate::probe::Prober;

/// How long to wait before the next cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// On schedule: sleep until the deadline
    Until(Instant),
    /// Behind schedule: run right away, `skipped` ticks were coalesced into this one
    Immediately { skipped: u64 },
}

/// Result of [`next_tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextTick {
    /// Ideal start time of the upcoming cycle
    pub ideal: Instant,
    pub wait: Wait,
}

/// Decide when the cycle after the one that ideally started at `ideal` runs
///
/// Cycle starts stay on the grid `ideal + k * period`, so lateness never
/// accumulates. When a cycle overruns one or more periods, the missed grid
/// points collapse into a single immediate run aligned to the latest one.
pub fn next_tick(ideal: Instant, period: Duration, now: Instant) -> NextTick {
    let next = ideal + period;
    if now < next || period.is_zero() {
        return NextTick {
            ideal: next,
            wait: Wait::Until(next),
        };
    }

    let behind = now.duration_since(ideal).as_nanos();
    let elapsed_periods = (behind / period.as_nanos()).max(1);
    let offset = period.as_nanos() * elapsed_periods;
    let latest = ideal + Duration::from_nanos(offset.min(u64::MAX as u128) as u64);

    NextTick {
        ideal: latest,
        wait: Wait::Immediately {
            skipped: elapsed_periods.min(u64::MAX as u128) as u64 - 1,
        },
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Timestamp stamped on every point emitted by this cycle
    pub timestamp: DateTime<Utc>,
    pub probed: usize,
    pub online: usize,
    pub elapsed: Duration,
}

/// Task that probes one bucket every `interval_secs`
pub struct CycleDriver {
    interval_secs: u64,
    scheduler: Scheduler,
}

impl CycleDriver {
    pub fn new(interval_secs: u64, scheduler: Scheduler) -> Self {
        Self {
            interval_secs,
            scheduler,
        }
    }

    fn period(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(1, MAX_INTERVAL_SECS))
    }

    /// Run cycles until shutdown, or until the probe mechanism turns out to be unusable
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let ctx = self.scheduler.context();
        let period = self.period();
        let mut ideal = Instant::now();
        info!(interval_secs = self.interval_secs, "Cycle driver running");

        loop {
            let outcome = tokio::select! {
                outcome = self.run_cycle() => outcome,
                _ = shutdown.recv() => break,
            };

            match outcome {
                Ok(report) if report.probed > 0 => {
                    ctx.metrics
                        .observe_cycle(self.interval_secs, report.elapsed.as_secs_f64());
                    ctx.logger.log_cycle(
                        self.interval_secs,
                        report.probed,
                        report.online,
                        report.elapsed.as_millis(),
                    );
                }
                Ok(_) => debug!(interval_secs = self.interval_secs, "Bucket empty, idling"),
                Err(err) => {
                    error!(
                        interval_secs = self.interval_secs,
                        error = %err,
                        "Probing unavailable, stopping cycle driver"
                    );
                    ctx.health.mark_unhealthy(components::SCHEDULER, err.to_string());
                    return;
                }
            }

            let next = next_tick(ideal, period, Instant::now());
            ideal = next.ideal;
            match next.wait {
                Wait::Until(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = shutdown.recv() => break,
                    }
                }
                Wait::Immediately { skipped } => {
                    if skipped > 0 {
                        ctx.metrics.add_skipped_ticks(self.interval_secs, skipped);
                        ctx.logger.log_skipped_ticks(self.interval_secs, skipped);
                    }
                    match shutdown.try_recv() {
                        Err(TryRecvError::Empty) => {}
                        _ => break,
                    }
                }
            }
        }

        info!(interval_secs = self.interval_secs, "Cycle driver stopped");
    }

    /// Probe every device in the bucket once and publish the results
    pub async fn run_cycle(&self) -> Result<CycleReport, ProbeError> {
        let ctx = self.scheduler.context();
        let started = Instant::now();
        let timestamp = Utc::now();
        let devices = self.scheduler.snapshot(self.interval_secs).await;

        if devices.is_empty() {
            return Ok(CycleReport {
                timestamp,
                probed: 0,
                online: 0,
                elapsed: started.elapsed(),
            });
        }

        let results = self.probe_all(ctx.prober.clone(), &devices).await?;

        let mut seen = Vec::new();
        for (device, liveness) in devices.iter().zip(results) {
            let point = TelemetryPoint::liveness(timestamp, liveness);
            if let Err(err) = ctx.gateway.emit_point(&device.name, &point).await {
                ctx.metrics.inc_telemetry_error();
                warn!(device = %device.name, error = %err, "Failed to publish liveness");
            }
            ctx.status
                .refresh(&device.id, &device.address, liveness, timestamp);
            ctx.metrics.inc_probe(liveness);
            if liveness.is_up() {
                seen.push(device.id.clone());
            }
        }

        if let Err(err) = ctx.registry.record_seen(&seen, timestamp).await {
            warn!(error = %err, "Failed to record last-seen times");
        }

        Ok(CycleReport {
            timestamp,
            probed: devices.len(),
            online: seen.len(),
            elapsed: started.elapsed(),
        })
    }

    /// Probe all devices concurrently; results line up with `devices`
    ///
    /// A probe that errors or whose task dies counts as down. Only an
    /// unusable probe mechanism fails the whole batch.
    async fn probe_all(
        &self,
        prober: Arc<dyn Prober>,
        devices: &[Device],
    ) -> Result<Vec<Liveness>, ProbeError> {
        let ctx = self.scheduler.context();
        let mut tasks = JoinSet::new();
        for (index, device) in devices.iter().enumerate() {
            let prober = prober.clone();
            let address = device.address.clone();
            let metrics = ctx.metrics.clone();
            tasks.spawn(async move {
                let started = Instant::now();
                let result = prober.probe(&address).await;
                metrics.observe_probe(started.elapsed().as_secs_f64());
                (index, result)
            });
        }

        let mut results = vec![Liveness::Down; devices.len()];
        let mut unavailable = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(liveness))) => results[index] = liveness,
                Ok((_, Err(ProbeError::Unavailable(reason)))) => {
                    unavailable.get_or_insert(reason);
                }
                Ok((index, Err(err))) => {
                    ctx.metrics.inc_probe_error();
                    debug!(address = %devices[index].address, error = %err, "Probe failed");
                }
                Err(err) => {
                    ctx.metrics.inc_probe_error();
                    warn!(error = %err, "Probe task aborted");
                }
            }
        }

        match unavailable {
            Some(reason) => Err(ProbeError::Unavailable(reason)),
            None => Ok(results),
        }
    }
}
