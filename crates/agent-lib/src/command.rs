//! Remote commands that mutate the device set
//!
//! Every command writes the registry first. Buckets, the status map and
//! the gateway session only change once the write succeeded, so a failed
//! command leaves the in-memory schedule untouched.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::error::CommandError;
use crate::gateway::RpcRequest;
use crate::models::{check_interval, DeviceUpdate, NewDevice, DEFAULT_INTERVAL_SECS};
use crate::schedule::Scheduler;

/// Method names accepted over the gateway
pub const METHODS: &[&str] = &[
    "update_ping_period",
    "add_device",
    "delete_device",
    "update_device",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PingPeriodParams {
    #[serde(alias = "ping_period", alias = "interval")]
    pub seconds: u64,
}

/// Attributes of a device to register; the interval falls back to the handler default
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddDeviceParams {
    #[serde(alias = "identifier")]
    pub id: String,
    pub name: String,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(alias = "ping_period", alias = "interval", default)]
    pub interval_secs: Option<u64>,
}

impl AddDeviceParams {
    pub fn into_device(self, default_interval_secs: u64) -> NewDevice {
        NewDevice {
            id: self.id,
            name: self.name,
            address: self.address,
            interval_secs: self.interval_secs.unwrap_or(default_interval_secs),
        }
    }
}

impl From<NewDevice> for AddDeviceParams {
    fn from(device: NewDevice) -> Self {
        Self {
            id: device.id,
            name: device.name,
            address: device.address,
            interval_secs: Some(device.interval_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeleteDeviceParams {
    pub name: String,
}

/// Identity changes for the device currently called `name`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpdateDeviceParams {
    pub name: String,
    #[serde(rename = "newIdentifier", alias = "id", default)]
    pub new_id: Option<String>,
    #[serde(rename = "newAddress", alias = "ip", default)]
    pub new_address: Option<String>,
    #[serde(rename = "newName", default)]
    pub new_name: Option<String>,
}

impl UpdateDeviceParams {
    pub fn changes(&self) -> DeviceUpdate {
        DeviceUpdate {
            id: self.new_id.clone(),
            name: self.new_name.clone(),
            address: self.new_address.clone(),
        }
    }
}

/// A decoded remote command
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Change the probe interval of the device the request is addressed to
    UpdatePingPeriod(PingPeriodParams),
    AddDevice(AddDeviceParams),
    DeleteDevice(DeleteDeviceParams),
    UpdateDevice(UpdateDeviceParams),
}

impl RemoteCommand {
    /// Decode a gateway method and its params
    pub fn parse(method: &str, params: &Value) -> Result<Self, CommandError> {
        if !METHODS.contains(&method) {
            return Err(CommandError::UnknownMethod(method.to_string()));
        }
        serde_json::from_value(json!({"method": method, "params": params}))
            .map_err(|e| CommandError::InvalidParams(e.to_string()))
    }

    pub fn method(&self) -> &'static str {
        match self {
            RemoteCommand::UpdatePingPeriod(_) => "update_ping_period",
            RemoteCommand::AddDevice(_) => "add_device",
            RemoteCommand::DeleteDevice(_) => "delete_device",
            RemoteCommand::UpdateDevice(_) => "update_device",
        }
    }
}

/// Applies remote commands to the registry and the running schedule
#[derive(Clone)]
pub struct CommandHandler {
    scheduler: Scheduler,
    default_interval_secs: u64,
}

impl CommandHandler {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            default_interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }

    /// Interval given to added devices that do not name one
    pub fn with_default_interval(mut self, secs: u64) -> Self {
        self.default_interval_secs = secs.max(1);
        self
    }

    /// Answer requests until the channel closes or shutdown is signalled
    pub async fn run(
        self,
        mut requests: mpsc::Receiver<RpcRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Starting command dispatcher");
        let gateway = self.scheduler.context().gateway.clone();

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let success = self.handle(&request).await;
                    if let Err(err) = gateway.reply(&request.device, request.id, success).await {
                        warn!(request_id = request.id, error = %err, "Failed to send command reply");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("Command dispatcher stopped");
    }

    /// Decode and apply one request; returns the acknowledgement to send
    pub async fn handle(&self, request: &RpcRequest) -> bool {
        let ctx = self.scheduler.context();
        let result = match RemoteCommand::parse(&request.method, &request.params) {
            Ok(command) => self.execute(&request.device, command).await,
            Err(err) => Err(err),
        };

        let success = result.is_ok();
        let label = if METHODS.contains(&request.method.as_str()) {
            request.method.as_str()
        } else {
            "unknown"
        };
        ctx.metrics.inc_command(label, success);
        let detail = result.err().map(|e| e.to_string());
        ctx.logger
            .log_command(&request.device, &request.method, success, detail.as_deref());
        success
    }

    /// Apply a decoded command on behalf of the device named `target`
    pub async fn execute(&self, target: &str, command: RemoteCommand) -> Result<(), CommandError> {
        match command {
            RemoteCommand::UpdatePingPeriod(params) => {
                self.update_ping_period(target, params.seconds).await
            }
            RemoteCommand::AddDevice(params) => {
                self.add_device(params.into_device(self.default_interval_secs))
                    .await
            }
            RemoteCommand::DeleteDevice(params) => self.delete_device(&params.name).await,
            RemoteCommand::UpdateDevice(params) => self.update_device(params).await,
        }
    }

    async fn update_ping_period(&self, name: &str, seconds: u64) -> Result<(), CommandError> {
        check_interval(seconds).map_err(CommandError::InvalidParams)?;
        let ctx = self.scheduler.context();
        let device = ctx
            .registry
            .get_by_name(name)
            .await?
            .ok_or_else(|| CommandError::DeviceNotFound(name.to_string()))?;

        ctx.registry.update_interval(&device.id, seconds).await?;
        // the reconciler moves the device; this only wakes it
        self.scheduler.mark_dirty();
        Ok(())
    }

    async fn add_device(&self, device: NewDevice) -> Result<(), CommandError> {
        device.validate().map_err(CommandError::InvalidParams)?;
        let ctx = self.scheduler.context();
        let device = ctx.registry.create(device, false).await?;

        ctx.status.seed(&device.id, &device.address);
        {
            let mut state = self.scheduler.lock().await;
            state.buckets.upsert(device.clone());
            self.scheduler.ensure_drivers(&mut state);
        }

        if let Err(err) = ctx
            .gateway
            .connect_device(&device.name, &ctx.device_profile)
            .await
        {
            warn!(device = %device.name, error = %err, "Failed to connect new device on gateway");
        }
        Ok(())
    }

    async fn delete_device(&self, name: &str) -> Result<(), CommandError> {
        let ctx = self.scheduler.context();
        let device = ctx
            .registry
            .get_by_name(name)
            .await?
            .ok_or_else(|| CommandError::DeviceNotFound(name.to_string()))?;

        ctx.registry.delete(&device.id).await?;

        {
            let mut state = self.scheduler.lock().await;
            let interval = state.buckets.locate(&device.id).unwrap_or(device.interval_secs);
            state.buckets.remove(&device.id, interval);
        }
        ctx.status.remove(&device.id);

        if let Err(err) = ctx.gateway.disconnect_device(&device.name).await {
            warn!(device = %device.name, error = %err, "Failed to disconnect deleted device");
        }
        Ok(())
    }

    async fn update_device(&self, params: UpdateDeviceParams) -> Result<(), CommandError> {
        let changes = params.changes();
        if changes.is_empty() {
            return Err(CommandError::InvalidParams("no fields to update".into()));
        }
        let ctx = self.scheduler.context();
        let current = ctx
            .registry
            .get_by_name(&params.name)
            .await?
            .ok_or_else(|| CommandError::DeviceNotFound(params.name.clone()))?;

        let updated = ctx.registry.update_fields(&current.id, &changes).await?;

        ctx.status.rekey(&current.id, &updated.id, &updated.address);
        {
            let mut state = self.scheduler.lock().await;
            state.buckets.evict(&current.id);
            state.buckets.upsert(updated.clone());
            self.scheduler.ensure_drivers(&mut state);
        }

        if current.name != updated.name {
            if let Err(err) = ctx.gateway.disconnect_device(&current.name).await {
                warn!(device = %current.name, error = %err, "Failed to disconnect old device name");
            }
            if let Err(err) = ctx
                .gateway
                .connect_device(&updated.name, &ctx.device_profile)
                .await
            {
                warn!(device = %updated.name, error = %err, "Failed to connect new device name");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_ping_period() {
        let command = RemoteCommand::parse("update_ping_period", &json!({"seconds": 30})).unwrap();
        assert_eq!(
            command,
            RemoteCommand::UpdatePingPeriod(PingPeriodParams { seconds: 30 })
        );
        assert_eq!(command.method(), "update_ping_period");
    }

    #[test]
    fn test_parse_add_device_with_wire_aliases() {
        let command = RemoteCommand::parse(
            "add_device",
            &json!({"id": "cam-7", "name": "Gate", "ip": "10.0.0.7", "ping_period": 45}),
        )
        .unwrap();
        let RemoteCommand::AddDevice(params) = command else {
            panic!("expected add_device");
        };
        let device = params.into_device(60);
        assert_eq!(device.id, "cam-7");
        assert_eq!(device.address, "10.0.0.7");
        assert_eq!(device.interval_secs, 45);
    }

    #[test]
    fn test_add_device_without_interval_uses_default() {
        let command = RemoteCommand::parse(
            "add_device",
            &json!({"identifier": "cam-8", "name": "Yard", "address": "10.0.0.8"}),
        )
        .unwrap();
        let RemoteCommand::AddDevice(params) = command else {
            panic!("expected add_device");
        };
        assert_eq!(params.into_device(90).interval_secs, 90);
    }

    #[test]
    fn test_parse_update_device_aliases() {
        let command = RemoteCommand::parse(
            "update_device",
            &json!({"name": "Gate", "id": "cam-70", "ip": "10.0.0.70", "newName": "Gate East"}),
        )
        .unwrap();
        let RemoteCommand::UpdateDevice(params) = command else {
            panic!("expected update_device");
        };
        let changes = params.changes();
        assert_eq!(changes.id.as_deref(), Some("cam-70"));
        assert_eq!(changes.address.as_deref(), Some("10.0.0.70"));
        assert_eq!(changes.name.as_deref(), Some("Gate East"));
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let err = RemoteCommand::parse("reboot", &json!({})).unwrap_err();
        assert!(matches!(err, CommandError::UnknownMethod(m) if m == "reboot"));
    }

    #[test]
    fn test_bad_params_are_rejected() {
        let err = RemoteCommand::parse("update_ping_period", &json!({"seconds": "soon"})).unwrap_err();
        assert!(matches!(err, CommandError::InvalidParams(_)));

        let err = RemoteCommand::parse("delete_device", &Value::Null).unwrap_err();
        assert!(matches!(err, CommandError::InvalidParams(_)));
    }
}
