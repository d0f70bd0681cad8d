//! Observability for the liveness agent
//!
//! Provides:
//! - Prometheus metrics (cycle latency, probe outcomes, fleet counts, reconciliation, commands)
//! - Structured logging of significant agent events

use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{FleetTotals, Liveness};

/// Histogram buckets for probe cycle duration (seconds); a cycle spans several pings
const CYCLE_BUCKETS: &[f64] = &[0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0];

/// Histogram buckets for a single probe (seconds)
const PROBE_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 2.5, 3.0, 5.0, 10.0, 30.0];

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    cycle_duration_seconds: HistogramVec,
    probe_duration_seconds: Histogram,
    probes_total: IntCounterVec,
    skipped_ticks_total: IntCounterVec,
    devices_scheduled: IntGauge,
    buckets: IntGauge,
    devices_online: IntGauge,
    devices_offline: IntGauge,
    reconcile_passes_total: IntCounterVec,
    commands_total: IntCounterVec,
    telemetry_errors_total: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            cycle_duration_seconds: register_histogram_vec!(
                "fleetping_cycle_duration_seconds",
                "Wall time of one probe cycle, per interval bucket",
                &["interval"],
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            probe_duration_seconds: register_histogram!(
                "fleetping_probe_duration_seconds",
                "Wall time of a single device probe",
                PROBE_BUCKETS.to_vec()
            )
            .expect("Failed to register probe_duration_seconds"),

            probes_total: register_int_counter_vec!(
                "fleetping_probes_total",
                "Probe outcomes",
                &["result"]
            )
            .expect("Failed to register probes_total"),

            skipped_ticks_total: register_int_counter_vec!(
                "fleetping_skipped_ticks_total",
                "Cycle ticks dropped because a cycle overran its period",
                &["interval"]
            )
            .expect("Failed to register skipped_ticks_total"),

            devices_scheduled: register_int_gauge!(
                "fleetping_devices_scheduled",
                "Devices currently held in interval buckets"
            )
            .expect("Failed to register devices_scheduled"),

            buckets: register_int_gauge!(
                "fleetping_buckets",
                "Interval buckets with a running driver"
            )
            .expect("Failed to register buckets"),

            devices_online: register_int_gauge!(
                "fleetping_devices_online",
                "Devices whose latest probe succeeded"
            )
            .expect("Failed to register devices_online"),

            devices_offline: register_int_gauge!(
                "fleetping_devices_offline",
                "Devices whose latest probe failed or that were never probed"
            )
            .expect("Failed to register devices_offline"),

            reconcile_passes_total: register_int_counter_vec!(
                "fleetping_reconcile_passes_total",
                "Reconciliation passes by outcome",
                &["outcome"]
            )
            .expect("Failed to register reconcile_passes_total"),

            commands_total: register_int_counter_vec!(
                "fleetping_commands_total",
                "Remote commands handled",
                &["method", "outcome"]
            )
            .expect("Failed to register commands_total"),

            telemetry_errors_total: register_int_counter!(
                "fleetping_telemetry_errors_total",
                "Telemetry publishes that failed"
            )
            .expect("Failed to register telemetry_errors_total"),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same series
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_cycle(&self, interval_secs: u64, duration_secs: f64) {
        self.inner()
            .cycle_duration_seconds
            .with_label_values(&[&interval_secs.to_string()])
            .observe(duration_secs);
    }

    pub fn observe_probe(&self, duration_secs: f64) {
        self.inner().probe_duration_seconds.observe(duration_secs);
    }

    pub fn inc_probe(&self, liveness: Liveness) {
        self.inner()
            .probes_total
            .with_label_values(&[&liveness.to_string()])
            .inc();
    }

    pub fn inc_probe_error(&self) {
        self.inner().probes_total.with_label_values(&["error"]).inc();
    }

    pub fn add_skipped_ticks(&self, interval_secs: u64, skipped: u64) {
        self.inner()
            .skipped_ticks_total
            .with_label_values(&[&interval_secs.to_string()])
            .inc_by(skipped);
    }

    pub fn set_schedule_size(&self, devices: usize, buckets: usize) {
        self.inner().devices_scheduled.set(devices as i64);
        self.inner().buckets.set(buckets as i64);
    }

    pub fn set_fleet_totals(&self, totals: &FleetTotals) {
        self.inner().devices_online.set(totals.online as i64);
        self.inner().devices_offline.set(totals.offline as i64);
    }

    pub fn inc_reconcile(&self, outcome: &str) {
        self.inner()
            .reconcile_passes_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn inc_command(&self, method: &str, success: bool) {
        let outcome = if success { "ok" } else { "rejected" };
        self.inner()
            .commands_total
            .with_label_values(&[method, outcome])
            .inc();
    }

    pub fn inc_telemetry_error(&self) {
        self.inner().telemetry_errors_total.inc();
    }
}

/// Structured logger for agent lifecycle and scheduling events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str, devices: usize, buckets: usize) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            devices = devices,
            buckets = buckets,
            "Liveness agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Liveness agent shutting down"
        );
    }

    pub fn log_cycle(&self, interval_secs: u64, probed: usize, online: usize, elapsed_ms: u128) {
        info!(
            event = "cycle_completed",
            node = %self.node_name,
            interval_secs = interval_secs,
            probed = probed,
            online = online,
            offline = probed - online,
            elapsed_ms = elapsed_ms as u64,
            "Probe cycle completed"
        );
    }

    pub fn log_skipped_ticks(&self, interval_secs: u64, skipped: u64) {
        warn!(
            event = "ticks_skipped",
            node = %self.node_name,
            interval_secs = interval_secs,
            skipped = skipped,
            "Probe cycle overran its period, coalescing missed ticks"
        );
    }

    pub fn log_reconcile(&self, applied: usize, inserted: usize, moved: usize, drivers_started: usize) {
        info!(
            event = "devices_reconciled",
            node = %self.node_name,
            applied = applied,
            inserted = inserted,
            moved = moved,
            drivers_started = drivers_started,
            "Applied out-of-band registry changes"
        );
    }

    pub fn log_command(&self, device: &str, method: &str, success: bool, detail: Option<&str>) {
        if success {
            info!(
                event = "command_applied",
                node = %self.node_name,
                device = %device,
                method = %method,
                success = true,
                "Remote command applied"
            );
        } else {
            warn!(
                event = "command_applied",
                node = %self.node_name,
                device = %device,
                method = %method,
                success = false,
                detail = detail.unwrap_or(""),
                "Remote command rejected"
            );
        }
    }

    pub fn log_totals(&self, totals: &FleetTotals) {
        info!(
            event = "fleet_totals",
            node = %self.node_name,
            total = totals.total,
            online = totals.online,
            offline = totals.offline,
            "Published fleet totals"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_record() {
        let metrics = AgentMetrics::new();
        metrics.observe_cycle(60, 3.2);
        metrics.observe_probe(2.1);
        metrics.inc_probe(Liveness::Up);
        metrics.inc_probe_error();
        metrics.add_skipped_ticks(15, 2);
        metrics.set_schedule_size(10, 3);
        metrics.set_fleet_totals(&FleetTotals {
            total: 10,
            online: 7,
            offline: 3,
        });
        metrics.inc_reconcile("applied");
        metrics.inc_command("add_device", true);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "fleetping_probes_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("edge-01");
        assert_eq!(logger.node_name, "edge-01");
    }
}
