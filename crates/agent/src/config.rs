//! Agent configuration

use std::time::Duration;

use agent_lib::{
    aggregate::AggregateConfig, gateway::GatewayConfig, probe::PingConfig,
    schedule::ReconcileConfig, DEFAULT_INTERVAL_SECS,
};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

const ENV_PREFIX: &str = "FLEETPING";
const DEFAULT_MQTT_PORT: u16 = 1883;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name reported in structured logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// SQLite file holding the device registry
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Broker address, e.g. `mqtt://broker:1883`
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    #[serde(default)]
    pub gateway_token: String,

    #[serde(default = "default_gateway_client_id")]
    pub gateway_client_id: String,

    /// Seconds to wait for the first broker session at startup
    #[serde(default = "default_gateway_connect_timeout")]
    pub gateway_connect_timeout_secs: u64,

    /// Device type announced when connecting devices
    #[serde(default = "default_device_profile")]
    pub device_profile: String,

    #[serde(default = "default_totals_device_name")]
    pub totals_device_name: String,

    #[serde(default = "default_probe_count")]
    pub probe_count: u32,

    #[serde(default = "default_probe_spacing")]
    pub probe_spacing_secs: f64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,

    /// Interval given to devices added without one
    #[serde(default = "default_interval")]
    pub default_interval_secs: u64,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Treat every reconcile tick as flagged so out-of-band edits are picked up
    #[serde(default = "default_true")]
    pub poll_registry: bool,

    #[serde(default = "default_aggregate_interval")]
    pub aggregate_interval_secs: u64,

    #[serde(default = "default_aggregate_grace")]
    pub aggregate_grace_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "fleetping.sqlite".to_string()
}

fn default_gateway_url() -> String {
    format!("mqtt://localhost:{DEFAULT_MQTT_PORT}")
}

fn default_gateway_client_id() -> String {
    "fleetping".to_string()
}

fn default_gateway_connect_timeout() -> u64 {
    30
}

fn default_device_profile() -> String {
    "default".to_string()
}

fn default_totals_device_name() -> String {
    "CAMERAS_TOTALS".to_string()
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_spacing() -> f64 {
    1.0
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_probe_concurrency() -> usize {
    256
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_aggregate_interval() -> u64 {
    60
}

fn default_aggregate_grace() -> u64 {
    120
}

impl AgentConfig {
    /// Load configuration from `.env` (when present) and `FLEETPING_*` variables
    pub fn load() -> Result<Self> {
        // a missing .env file is the normal case
        let _ = dotenvy::dotenv();
        Self::from_source(config::Environment::with_prefix(ENV_PREFIX))
    }

    /// Build from an explicit environment source
    pub fn from_source(env: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read FLEETPING_* configuration")?;

        let parsed: AgentConfig = config
            .try_deserialize()
            .context("invalid FLEETPING_* configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<()> {
        if self.default_interval_secs == 0 {
            bail!("default_interval_secs must be positive");
        }
        if self.reconcile_interval_secs == 0 || self.aggregate_interval_secs == 0 {
            bail!("reconcile and aggregate intervals must be positive");
        }
        if self.probe_count == 0 {
            bail!("probe_count must be at least 1");
        }
        if !self.probe_spacing_secs.is_finite() || self.probe_spacing_secs < 0.0 {
            bail!("probe_spacing_secs must be a non-negative number");
        }
        parse_gateway_url(&self.gateway_url)?;
        Ok(())
    }

    pub fn gateway(&self) -> Result<GatewayConfig> {
        let (host, port) = parse_gateway_url(&self.gateway_url)?;
        Ok(GatewayConfig {
            host,
            port,
            client_id: self.gateway_client_id.clone(),
            token: self.gateway_token.clone(),
            ..GatewayConfig::default()
        })
    }

    pub fn gateway_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_connect_timeout_secs)
    }

    pub fn ping(&self) -> PingConfig {
        PingConfig {
            count: self.probe_count,
            spacing: Duration::from_secs_f64(self.probe_spacing_secs),
            timeout: Duration::from_secs(self.probe_timeout_secs),
            max_concurrent: self.probe_concurrency.max(1),
            ..PingConfig::default()
        }
    }

    pub fn reconcile(&self) -> ReconcileConfig {
        ReconcileConfig {
            interval: Duration::from_secs(self.reconcile_interval_secs),
            poll_registry: self.poll_registry,
        }
    }

    pub fn aggregate(&self) -> AggregateConfig {
        AggregateConfig {
            device_name: self.totals_device_name.clone(),
            interval: Duration::from_secs(self.aggregate_interval_secs),
            grace: Duration::from_secs(self.aggregate_grace_secs),
        }
    }
}

/// Split a broker URL into host and port; `mqtt` and `tcp` schemes only
pub fn parse_gateway_url(raw: &str) -> Result<(String, u16)> {
    let url = Url::parse(raw).with_context(|| format!("invalid gateway_url {raw:?}"))?;
    match url.scheme() {
        "mqtt" | "tcp" => {}
        other => bail!("unsupported gateway_url scheme {other:?}, expected mqtt or tcp"),
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .with_context(|| format!("gateway_url {raw:?} has no host"))?;
    Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MQTT_PORT)))
}
