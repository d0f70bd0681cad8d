//! Test doubles shared by module tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};

use crate::error::{ProbeError, RegistryResult, TransportError};
use crate::gateway::Gateway;
use crate::health::HealthRegistry;
use crate::models::{Device, DeviceUpdate, Liveness, NewDevice, TelemetryPoint};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::probe::Prober;
use crate::registry::{DeviceRegistry, MemoryRegistry};
use crate::schedule::{ProbeContext, Scheduler};
use crate::status::OnlineStatusMap;

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Connect { device: String, profile: String },
    Disconnect { device: String },
    Point { device: String, point: TelemetryPoint },
    Reply { device: String, id: i64, success: bool },
}

/// Gateway that records every call
#[derive(Default)]
pub struct RecordingGateway {
    events: Mutex<Vec<GatewayEvent>>,
    failing: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn points(&self) -> Vec<(String, TelemetryPoint)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::Point { device, point } => Some((device, point)),
                _ => None,
            })
            .collect()
    }

    pub fn points_for(&self, device: &str) -> Vec<TelemetryPoint> {
        self.points()
            .into_iter()
            .filter(|(name, _)| name == device)
            .map(|(_, point)| point)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn push(&self, event: GatewayEvent) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected("test gateway offline".into()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn connect_device(&self, device: &str, profile: &str) -> Result<(), TransportError> {
        self.push(GatewayEvent::Connect {
            device: device.to_string(),
            profile: profile.to_string(),
        })
    }

    async fn disconnect_device(&self, device: &str) -> Result<(), TransportError> {
        self.push(GatewayEvent::Disconnect {
            device: device.to_string(),
        })
    }

    async fn emit_point(&self, device: &str, point: &TelemetryPoint) -> Result<(), TransportError> {
        self.push(GatewayEvent::Point {
            device: device.to_string(),
            point: point.clone(),
        })
    }

    async fn reply(&self, device: &str, request_id: i64, success: bool) -> Result<(), TransportError> {
        self.push(GatewayEvent::Reply {
            device: device.to_string(),
            id: request_id,
            success,
        })
    }
}

/// Scripted behaviour for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Up,
    Down,
    Fail,
    Unavailable,
    Panic,
}

/// Prober answering from a per-address script
pub struct ScriptedProber {
    scripts: DashMap<String, Script>,
    fallback: Script,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(fallback: Script) -> Arc<Self> {
        Self::with_delay(fallback, Duration::ZERO)
    }

    /// Each probe sleeps `delay` before answering
    pub fn with_delay(fallback: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: DashMap::new(),
            fallback,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, address: &str, script: Script) {
        self.scripts.insert(address.to_string(), script);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, address: &str) -> Result<Liveness, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self
            .scripts
            .get(address)
            .map(|s| *s)
            .unwrap_or(self.fallback);
        match script {
            Script::Up => Ok(Liveness::Up),
            Script::Down => Ok(Liveness::Down),
            Script::Fail => Err(ProbeError::Failed("scripted failure".into())),
            Script::Unavailable => Err(ProbeError::Unavailable("scripted outage".into())),
            Script::Panic => panic!("scripted probe panic"),
        }
    }
}

/// Registry that, once armed, parks the next `list_dirty` after reading until resumed
pub struct PausingRegistry {
    inner: Arc<MemoryRegistry>,
    armed: AtomicBool,
    paused: Notify,
    resume: Notify,
}

impl PausingRegistry {
    pub fn new(inner: Arc<MemoryRegistry>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            armed: AtomicBool::new(false),
            paused: Notify::new(),
            resume: Notify::new(),
        })
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once a `list_dirty` call has read its records and parked
    pub async fn wait_paused(&self) {
        self.paused.notified().await;
    }

    pub fn resume(&self) {
        self.resume.notify_one();
    }
}

#[async_trait]
impl DeviceRegistry for PausingRegistry {
    async fn list_all(&self) -> RegistryResult<Vec<Device>> {
        self.inner.list_all().await
    }

    async fn list_by_interval(&self, interval_secs: u64) -> RegistryResult<Vec<Device>> {
        self.inner.list_by_interval(interval_secs).await
    }

    async fn list_distinct_intervals(&self) -> RegistryResult<Vec<u64>> {
        self.inner.list_distinct_intervals().await
    }

    async fn list_dirty(&self) -> RegistryResult<Vec<Device>> {
        let dirty = self.inner.list_dirty().await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.paused.notify_one();
            self.resume.notified().await;
        }
        Ok(dirty)
    }

    async fn get_by_id(&self, id: &str) -> RegistryResult<Option<Device>> {
        self.inner.get_by_id(id).await
    }

    async fn get_by_name(&self, name: &str) -> RegistryResult<Option<Device>> {
        self.inner.get_by_name(name).await
    }

    async fn create(&self, device: NewDevice, dirty: bool) -> RegistryResult<Device> {
        self.inner.create(device, dirty).await
    }

    async fn update_interval(&self, id: &str, interval_secs: u64) -> RegistryResult<Device> {
        self.inner.update_interval(id, interval_secs).await
    }

    async fn update_fields(&self, id: &str, update: &DeviceUpdate) -> RegistryResult<Device> {
        self.inner.update_fields(id, update).await
    }

    async fn delete(&self, id: &str) -> RegistryResult<()> {
        self.inner.delete(id).await
    }

    async fn clear_dirty(&self, reconciled: &[Device]) -> RegistryResult<usize> {
        self.inner.clear_dirty(reconciled).await
    }

    async fn record_seen(&self, ids: &[String], at: DateTime<Utc>) -> RegistryResult<()> {
        self.inner.record_seen(ids, at).await
    }
}

/// Everything a scheduler test needs, wired together
pub struct Harness {
    pub registry: Arc<MemoryRegistry>,
    pub prober: Arc<ScriptedProber>,
    pub gateway: Arc<RecordingGateway>,
    pub status: Arc<OnlineStatusMap>,
    pub health: HealthRegistry,
    pub scheduler: Scheduler,
    pub shutdown: broadcast::Sender<()>,
}

impl Harness {
    pub fn new(devices: Vec<NewDevice>, prober: Arc<ScriptedProber>) -> Self {
        let registry = Arc::new(MemoryRegistry::with_devices(devices));
        Self::with_registry(registry.clone(), registry, prober)
    }

    /// Wire the scheduler to `backend`, which must front `registry`
    pub fn with_registry(
        registry: Arc<MemoryRegistry>,
        backend: Arc<dyn DeviceRegistry>,
        prober: Arc<ScriptedProber>,
    ) -> Self {
        let gateway = RecordingGateway::new();
        let status = Arc::new(OnlineStatusMap::new());
        let health = HealthRegistry::new();
        let (shutdown, _) = broadcast::channel(1);

        let ctx = ProbeContext {
            registry: backend,
            prober: prober.clone() as Arc<dyn Prober>,
            gateway: gateway.clone() as Arc<dyn Gateway>,
            status: status.clone(),
            health: health.clone(),
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new("test-node"),
            device_profile: "camera".to_string(),
        };
        let scheduler = Scheduler::new(ctx, shutdown.clone());

        Self {
            registry,
            prober,
            gateway,
            status,
            health,
            scheduler,
            shutdown,
        }
    }

    /// Put every registry device into its bucket without starting drivers
    pub async fn stage(&self) {
        let devices = self.registry.list_all().await.unwrap();
        let mut state = self.scheduler.lock().await;
        for device in devices {
            self.status.seed(&device.id, &device.address);
            state.buckets.upsert(device);
        }
    }

    /// Load every registry device into the scheduler, starting drivers
    pub async fn start(&self) -> usize {
        let devices = self.registry.list_all().await.unwrap();
        self.scheduler.load(devices).await
    }
}

pub fn camera(id: &str, name: &str, address: &str, interval_secs: u64) -> NewDevice {
    NewDevice::new(id, name, address).with_interval(interval_secs)
}
