//! Fleetping Agent - IP camera fleet liveness monitor
//!
//! Probes every registered device on its own interval, publishes liveness
//! through an MQTT gateway and applies remote commands to the schedule.

use agent_lib::{
    aggregate::AggregateReporter,
    command::CommandHandler,
    gateway::{Gateway, MqttGateway},
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    probe::{PingProber, Prober},
    registry::{DeviceRegistry, SqliteRegistry},
    schedule::{ProbeContext, Reconciler, Scheduler},
    status::OnlineStatusMap,
};
use anyhow::{Context, Result};
use fleetping_agent::{
    api,
    config::AgentConfig,
    startup::{connect_fleet, disconnect_fleet, load_schedule, read_fleet},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
const COMMAND_QUEUE: usize = 64;
const GATEWAY_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting fleetping-agent");

    let config = AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        database = %config.database_path,
        gateway = %config.gateway_url,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    for component in [
        components::REGISTRY,
        components::GATEWAY,
        components::SCHEDULER,
        components::RECONCILER,
    ] {
        health_registry.register(component);
    }

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let registry: Arc<dyn DeviceRegistry> = Arc::new(
        SqliteRegistry::open(&config.database_path)
            .await
            .with_context(|| format!("failed to open registry at {}", config.database_path))?,
    );
    health_registry.mark_healthy(components::REGISTRY);

    // Workers and the gateway event loop stop separately so device
    // disconnects can still be flushed after the workers are gone.
    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let (gateway_stop_tx, _) = broadcast::channel::<()>(1);

    let (mqtt, event_loop) = MqttGateway::new(&config.gateway()?);
    let (request_tx, request_rx) = mpsc::channel(COMMAND_QUEUE);
    let event_loop_handle = tokio::spawn(event_loop.run(
        request_tx,
        health_registry.clone(),
        gateway_stop_tx.subscribe(),
    ));

    if let Err(err) = mqtt.wait_connected(config.gateway_connect_timeout()).await {
        let _ = gateway_stop_tx.send(());
        return Err(err).context("gateway broker unreachable");
    }
    let gateway = Arc::new(mqtt);

    let fleet = match read_fleet(registry.as_ref()).await {
        Ok(fleet) => fleet,
        Err(err) => {
            close_gateway(&gateway, event_loop_handle, &gateway_stop_tx).await;
            return Err(err);
        }
    };
    let connected = match connect_fleet(
        gateway.as_ref(),
        &config.totals_device_name,
        &config.device_profile,
        &fleet,
    )
    .await
    {
        Ok(connected) => connected,
        Err(err) => {
            close_gateway(&gateway, event_loop_handle, &gateway_stop_tx).await;
            return Err(err);
        }
    };

    let status = Arc::new(OnlineStatusMap::new());
    let prober: Arc<dyn Prober> = Arc::new(PingProber::new(config.ping()));
    let ctx = ProbeContext {
        registry: registry.clone(),
        prober,
        gateway: gateway.clone() as Arc<dyn Gateway>,
        status: status.clone(),
        health: health_registry.clone(),
        metrics: metrics.clone(),
        logger: logger.clone(),
        device_profile: config.device_profile.clone(),
    };
    let scheduler = Scheduler::new(ctx, shutdown_tx.clone());

    let drivers = match load_schedule(&scheduler, registry.as_ref(), fleet).await {
        Ok(drivers) => drivers,
        Err(err) => {
            error!(error = %err, "Startup failed after devices were connected");
            disconnect_fleet(gateway.as_ref(), &connected).await;
            close_gateway(&gateway, event_loop_handle, &gateway_stop_tx).await;
            return Err(err);
        }
    };
    health_registry.mark_healthy(components::SCHEDULER);

    tokio::spawn(
        Reconciler::new(scheduler.clone(), config.reconcile()).run(shutdown_tx.subscribe()),
    );
    tokio::spawn(
        AggregateReporter::new(
            status.clone(),
            gateway.clone() as Arc<dyn Gateway>,
            config.aggregate(),
            metrics.clone(),
            logger.clone(),
        )
        .run(shutdown_tx.subscribe()),
    );
    tokio::spawn(
        CommandHandler::new(scheduler.clone())
            .with_default_interval(config.default_interval_secs)
            .run(request_rx, shutdown_tx.subscribe()),
    );

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        scheduler.clone(),
        status.clone(),
    ));
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_port, app_state).await {
            error!(error = %err, "API server stopped");
        }
    });

    // Mark agent as ready after initialization
    health_registry.set_ready(true);
    logger.log_startup(AGENT_VERSION, status.len(), drivers);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false);
    let _ = shutdown_tx.send(());

    let mut names: Vec<String> = scheduler
        .all_devices()
        .await
        .into_iter()
        .map(|device| device.name)
        .collect();
    names.push(config.totals_device_name.clone());
    disconnect_fleet(gateway.as_ref(), &names).await;
    close_gateway(&gateway, event_loop_handle, &gateway_stop_tx).await;

    info!("Shutdown complete");
    Ok(())
}

async fn close_gateway(
    gateway: &MqttGateway,
    event_loop: tokio::task::JoinHandle<()>,
    stop: &broadcast::Sender<()>,
) {
    if let Err(err) = gateway.close().await {
        warn!(error = %err, "Failed to close gateway session");
        let _ = stop.send(());
    }
    if tokio::time::timeout(GATEWAY_FLUSH_TIMEOUT, event_loop)
        .await
        .is_err()
    {
        warn!("Gateway event loop did not stop in time");
        let _ = stop.send(());
    }
}
