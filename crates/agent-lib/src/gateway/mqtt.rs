//! MQTT transport for the gateway API

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::{topics, Gateway, RpcRequest};
use crate::error::TransportError;
use crate::health::{components, HealthRegistry};
use crate::models::TelemetryPoint;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Connection settings for the gateway broker
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Gateway access token, sent as the MQTT username
    pub token: String,
    pub keep_alive: Duration,
    /// Capacity of the client request queue
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "fleetping".to_string(),
            token: String::new(),
            keep_alive: Duration::from_secs(30),
            queue_capacity: 1024,
        }
    }
}

/// Gateway session over an MQTT broker
#[derive(Clone)]
pub struct MqttGateway {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
}

impl MqttGateway {
    /// Create the client half and the event loop that must be driven for it to make progress
    pub fn new(config: &GatewayConfig) -> (Self, GatewayEventLoop) {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        if !config.token.is_empty() {
            options.set_credentials(config.token.clone(), String::new());
        }

        let (client, eventloop) = AsyncClient::new(options, config.queue_capacity);
        let (connected_tx, connected_rx) = watch::channel(false);

        let gateway = Self {
            client: client.clone(),
            connected: connected_rx,
        };
        let event_loop = GatewayEventLoop {
            client,
            eventloop,
            connected: connected_tx,
        };
        (gateway, event_loop)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the broker has acknowledged the session
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut connected = self.connected.clone();
        tokio::time::timeout(timeout, connected.wait_for(|up| *up))
            .await
            .map_err(|_| TransportError::Disconnected(format!("no broker session after {timeout:?}")))?
            .map_err(|_| TransportError::Disconnected("gateway event loop stopped".into()))?;
        Ok(())
    }

    /// End the broker session; the event loop exits once the disconnect is flushed
    pub async fn close(&self) -> Result<(), TransportError> {
        self.client.disconnect().await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&payload)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Gateway for MqttGateway {
    async fn connect_device(&self, device: &str, profile: &str) -> Result<(), TransportError> {
        debug!(device = %device, profile = %profile, "Connecting device on gateway");
        self.publish(topics::CONNECT, json!({"device": device, "type": profile}))
            .await
    }

    async fn disconnect_device(&self, device: &str) -> Result<(), TransportError> {
        debug!(device = %device, "Disconnecting device on gateway");
        self.publish(topics::DISCONNECT, json!({"device": device}))
            .await
    }

    async fn emit_point(&self, device: &str, point: &TelemetryPoint) -> Result<(), TransportError> {
        self.publish(topics::TELEMETRY, telemetry_payload(device, point)?)
            .await
    }

    async fn reply(
        &self,
        device: &str,
        request_id: i64,
        success: bool,
    ) -> Result<(), TransportError> {
        self.publish(topics::RPC, rpc_reply_payload(device, request_id, success))
            .await
    }
}

/// Drives the MQTT connection and forwards inbound commands
pub struct GatewayEventLoop {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: watch::Sender<bool>,
}

impl GatewayEventLoop {
    /// Poll the connection until shutdown or until the session is closed
    ///
    /// rumqttc reconnects on the next poll after an error; the command
    /// subscription is renewed on every fresh session.
    pub async fn run(
        mut self,
        requests: mpsc::Sender<RpcRequest>,
        health: HealthRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Starting gateway event loop");

        loop {
            tokio::select! {
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("Gateway session established");
                        if let Err(err) = self.client.try_subscribe(topics::RPC, QoS::AtLeastOnce) {
                            warn!(error = %err, "Failed to subscribe to command topic");
                        }
                        self.connected.send_replace(true);
                        health.mark_healthy(components::GATEWAY);
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic != topics::RPC {
                            continue;
                        }
                        match parse_rpc_request(&publish.payload) {
                            Some(request) => {
                                if requests.send(request).await.is_err() {
                                    warn!("Command dispatcher gone, dropping request");
                                }
                            }
                            None => {
                                // our own replies arrive here too and carry no method
                                debug!(topic = %publish.topic, "Ignoring non-request gateway message");
                            }
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("Gateway session closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        self.connected.send_replace(false);
                        health.mark_unhealthy(components::GATEWAY, err.to_string());
                        warn!(error = %err, "Gateway connection dropped; reconnecting");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Gateway event loop shutting down");
                    break;
                }
            }
        }

        self.connected.send_replace(false);
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    device: String,
    data: RpcData,
}

#[derive(Debug, Deserialize)]
struct RpcData {
    id: i64,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Decode a gateway command message; returns `None` for anything else
pub fn parse_rpc_request(payload: &[u8]) -> Option<RpcRequest> {
    let envelope: RpcEnvelope = serde_json::from_slice(payload).ok()?;
    Some(RpcRequest {
        device: envelope.device,
        id: envelope.data.id,
        method: envelope.data.method,
        params: envelope.data.params,
    })
}

/// Body for `v1/gateway/telemetry`: `{"<device>": [{"ts": .., "values": {..}}]}`
pub fn telemetry_payload(device: &str, point: &TelemetryPoint) -> Result<Value, TransportError> {
    let mut body = serde_json::Map::new();
    body.insert(device.to_string(), json!([serde_json::to_value(point)?]));
    Ok(Value::Object(body))
}

/// Body acknowledging a command
pub fn rpc_reply_payload(device: &str, request_id: i64, success: bool) -> Value {
    json!({
        "device": device,
        "id": request_id,
        "data": {"success": success}
    })
}
