//! Fleet-wide liveness rollup

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::gateway::Gateway;
use crate::models::{FleetTotals, TelemetryPoint};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::status::OnlineStatusMap;

#[derive(Debug, Clone)]
pub struct AggregateConfig {
    /// Pseudo-device the totals are published under
    pub device_name: String,
    pub interval: Duration,
    /// Delay before the first report, so every bucket has completed a cycle
    pub grace: Duration,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            device_name: "CAMERAS_TOTALS".to_string(),
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(120),
        }
    }
}

/// Periodically publishes total, online and offline counts
pub struct AggregateReporter {
    status: Arc<OnlineStatusMap>,
    gateway: Arc<dyn Gateway>,
    config: AggregateConfig,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl AggregateReporter {
    pub fn new(
        status: Arc<OnlineStatusMap>,
        gateway: Arc<dyn Gateway>,
        config: AggregateConfig,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            status,
            gateway,
            config,
            metrics,
            logger,
        }
    }

    /// Compute the rollup and publish it under the totals device
    pub async fn report_once(&self) -> Result<FleetTotals, TransportError> {
        let totals = self.status.totals();
        let point = TelemetryPoint::totals(Utc::now(), &totals);
        self.gateway
            .emit_point(&self.config.device_name, &point)
            .await?;
        self.metrics.set_fleet_totals(&totals);
        self.logger.log_totals(&totals);
        Ok(totals)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            grace_secs = self.config.grace.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "Starting aggregate reporter"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.config.grace) => {}
            _ = shutdown.recv() => return,
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.report_once().await {
                        self.metrics.inc_telemetry_error();
                        warn!(error = %err, "Failed to publish fleet totals");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Aggregate reporter shutting down");
                    break;
                }
            }
        }
    }
}
