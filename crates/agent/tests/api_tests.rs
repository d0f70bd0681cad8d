//! Integration tests for the agent API endpoints

use agent_lib::{
    gateway::Gateway,
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    probe::Prober,
    registry::{DeviceRegistry, MemoryRegistry},
    schedule::{ProbeContext, Scheduler},
    status::OnlineStatusMap,
    Liveness, NewDevice, ProbeError, TelemetryPoint, TransportError,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use fleetping_agent::api::{create_router, AppState};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceExt;

struct AlwaysUp;

#[async_trait]
impl Prober for AlwaysUp {
    async fn probe(&self, _address: &str) -> Result<Liveness, ProbeError> {
        Ok(Liveness::Up)
    }
}

struct NullGateway;

#[async_trait]
impl Gateway for NullGateway {
    async fn connect_device(&self, _device: &str, _profile: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect_device(&self, _device: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn emit_point(&self, _device: &str, _point: &TelemetryPoint) -> Result<(), TransportError> {
        Ok(())
    }

    async fn reply(&self, _device: &str, _request_id: i64, _success: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

fn setup_test_app(devices: Vec<NewDevice>) -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::REGISTRY);
    health_registry.register(components::GATEWAY);

    let status = Arc::new(OnlineStatusMap::new());
    let (shutdown, _) = broadcast::channel(1);
    let ctx = ProbeContext {
        registry: Arc::new(MemoryRegistry::with_devices(devices)) as Arc<dyn DeviceRegistry>,
        prober: Arc::new(AlwaysUp) as Arc<dyn Prober>,
        gateway: Arc::new(NullGateway) as Arc<dyn Gateway>,
        status: status.clone(),
        health: health_registry.clone(),
        metrics: AgentMetrics::new(),
        logger: StructuredLogger::new("api-test"),
        device_profile: "camera".to_string(),
    };
    let scheduler = Scheduler::new(ctx, shutdown);

    let state = Arc::new(AppState::new(health_registry, scheduler, status));
    let router = create_router(state.clone());

    (router, state)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app(vec![]);

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["registry"].is_object());
    assert!(health["components"]["gateway"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app(vec![]);

    state
        .health_registry
        .mark_degraded(components::GATEWAY, "Reconnecting");

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app(vec![]);

    state
        .health_registry
        .mark_unhealthy(components::SCHEDULER, "ping binary missing");

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(
        health["components"]["scheduler"]["message"],
        "ping binary missing"
    );
}

#[tokio::test]
async fn test_readyz_returns_503_until_ready() {
    let (app, state) = setup_test_app(vec![]);

    let (status, readiness) = get_json(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.health_registry.set_ready(true);

    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let (app, state) = setup_test_app(vec![]);

    state.health_registry.set_ready(true);
    state
        .health_registry
        .mark_unhealthy(components::REGISTRY, "database locked");

    let (status, _) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state) = setup_test_app(vec![]);

    let metrics = AgentMetrics::new();
    metrics.observe_cycle(60, 3.1);
    metrics.observe_probe(2.0);
    metrics.inc_probe(Liveness::Down);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("fleetping_cycle_duration_seconds_bucket"));
    assert!(metrics_text.contains("fleetping_probe_duration_seconds_count"));
    assert!(metrics_text.contains("fleetping_probes_total"));
    assert!(metrics_text.contains("fleetping_devices_scheduled"));
}

#[tokio::test]
async fn test_buckets_lists_intervals_in_order() {
    let devices = vec![
        NewDevice::new("cam-1", "Lobby", "10.0.0.1").with_interval(60),
        NewDevice::new("cam-2", "Dock", "10.0.0.2").with_interval(15),
        NewDevice::new("cam-3", "Gate", "10.0.0.3").with_interval(60),
    ];
    let (app, state) = setup_test_app(devices);

    let loaded = state
        .scheduler
        .context()
        .registry
        .list_all()
        .await
        .unwrap();
    assert_eq!(state.scheduler.load(loaded).await, 2);

    let (status, buckets) = get_json(app, "/buckets").await;

    assert_eq!(status, StatusCode::OK);
    let buckets = buckets.as_array().unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0]["interval_secs"], 15);
    assert_eq!(buckets[0]["devices"], 1);
    assert_eq!(buckets[1]["interval_secs"], 60);
    assert_eq!(buckets[1]["devices"], 2);
    assert_eq!(buckets[1]["driver_running"], true);
}

#[tokio::test]
async fn test_totals_reports_fleet_counts() {
    let (app, state) = setup_test_app(vec![]);

    state.status.seed("cam-1", "10.0.0.1");
    state.status.seed("cam-2", "10.0.0.2");
    state
        .status
        .record("cam-1", "10.0.0.1", Liveness::Up, Utc::now());

    let (status, totals) = get_json(app, "/totals").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(totals["total"], 2);
    assert_eq!(totals["online"], 1);
    assert_eq!(totals["offline"], 1);
}
