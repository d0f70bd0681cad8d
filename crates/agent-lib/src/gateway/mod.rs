//! Telemetry gateway
//!
//! The agent speaks to an IoT platform as a gateway: it announces the
//! devices it represents, pushes timestamped telemetry on their behalf and
//! receives remote commands addressed to them.

mod mqtt;

pub use mqtt::{
    parse_rpc_request, rpc_reply_payload, telemetry_payload, GatewayConfig, GatewayEventLoop,
    MqttGateway,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::models::TelemetryPoint;

/// Gateway API topics
pub mod topics {
    pub const CONNECT: &str = "v1/gateway/connect";
    pub const DISCONNECT: &str = "v1/gateway/disconnect";
    pub const TELEMETRY: &str = "v1/gateway/telemetry";
    pub const RPC: &str = "v1/gateway/rpc";
}

/// A remote command delivered through the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Name of the device the command was addressed to
    pub device: String,
    /// Correlation id echoed in the reply
    pub id: i64,
    pub method: String,
    pub params: Value,
}

/// Outbound side of the gateway session
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Announce that the gateway now represents `device`
    async fn connect_device(&self, device: &str, profile: &str) -> Result<(), TransportError>;

    async fn disconnect_device(&self, device: &str) -> Result<(), TransportError>;

    /// Publish one telemetry point for `device`
    async fn emit_point(&self, device: &str, point: &TelemetryPoint) -> Result<(), TransportError>;

    /// Acknowledge a remote command
    async fn reply(&self, device: &str, request_id: i64, success: bool)
        -> Result<(), TransportError>;
}
