//! Gateway session state machine, free of sockets and timers.
//!
//! `SessionCore` holds all mutable session state behind a single lock in the
//! surrounding [`GatewaySession`](super::GatewaySession) and takes explicit
//! timestamps, so every transition can be exercised in tests with simulated
//! time and without a network.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::protocol::{model, Commands};
use crate::registry::DeviceRegistry;

/// Gateway considered offline after this long without a message from it.
pub const ONLINE_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum spacing between discovery requests.
pub const DISCOVERY_COOLDOWN: Duration = Duration::from_secs(10);

/// Period of the liveness check that recomputes online status.
pub const LIVENESS_TICK: Duration = Duration::from_secs(10);

/// Connection status of the gateway, derived from liveness of its own sid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Uninitialized,
    Discovering,
    Online,
    Offline,
}

/// Result of processing one inbound message.
#[derive(Debug, Default)]
pub struct Processed {
    /// Command payloads to send to the gateway, in order.
    pub outbound: Vec<String>,
    /// Device identifier to publish the message under (empty if the message
    /// carried no sid).
    pub publish_sid: String,
}

/// Per-gateway protocol state: session token, discovery throttle, device
/// registry, and online status.
pub struct SessionCore {
    gateway_sid: String,
    token: Option<String>,
    last_discovery: Option<Instant>,
    registry: DeviceRegistry,
    status: GatewayStatus,
    online_timeout: Duration,
    discovery_cooldown: Duration,
}

impl SessionCore {
    pub fn new(gateway_sid: &str) -> Self {
        Self {
            gateway_sid: gateway_sid.to_string(),
            token: None,
            last_discovery: None,
            registry: DeviceRegistry::new(),
            status: GatewayStatus::Uninitialized,
            online_timeout: ONLINE_TIMEOUT,
            discovery_cooldown: DISCOVERY_COOLDOWN,
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.status
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Whether an inbound message on the shared socket is relevant for this
    /// gateway: the source address matched the configured host, or the sid
    /// is the gateway's own or one of its registered devices.
    pub fn accepts(&self, message: &Value, source_matches: bool) -> bool {
        if source_matches {
            return true;
        }
        match message.get("sid").and_then(Value::as_str) {
            Some(sid) => sid == self.gateway_sid || self.registry.get(sid).is_some(),
            None => false,
        }
    }

    /// Transition to `Discovering` and issue the initial discovery request.
    pub fn start_discovery(&mut self, now: Instant) -> Vec<String> {
        self.status = GatewayStatus::Discovering;
        self.last_discovery = Some(now);
        vec![Commands::discover()]
    }

    /// Request a re-discovery, suppressed inside the cooldown window.
    pub fn request_discovery(&mut self, now: Instant) -> Option<String> {
        if let Some(last) = self.last_discovery {
            if now.saturating_duration_since(last) < self.discovery_cooldown {
                return None;
            }
        }
        self.last_discovery = Some(now);
        Some(Commands::discover())
    }

    /// Periodic liveness check: recompute online status from the gateway's
    /// own last-seen timestamp. Returns the new status if it changed.
    pub fn tick(&mut self, now: Instant) -> Option<GatewayStatus> {
        if self.status == GatewayStatus::Uninitialized {
            return None;
        }
        let online = self
            .registry
            .is_live(&self.gateway_sid, now, self.online_timeout);
        self.set_status(if online {
            GatewayStatus::Online
        } else {
            GatewayStatus::Offline
        })
    }

    /// Apply one inbound message to the session state.
    ///
    /// Updates the token, dispatches on the command type, records liveness
    /// for any sid the message carries, and opportunistically promotes the
    /// gateway to `Online` when its own sid shows activity. The caller
    /// forwards the message to observers afterwards, so observers always see
    /// post-update state.
    pub fn process_message(&mut self, command: &str, message: &Value, now: Instant) -> Processed {
        let mut processed = Processed::default();
        let sid = message.get("sid").and_then(Value::as_str).map(str::to_string);

        // Token is replaced wholesale on any message carrying one.
        if let Some(token) = message.get("token").and_then(Value::as_str) {
            self.token = Some(token.to_string());
        }

        match command {
            "get_id_list_ack" => {
                processed.outbound = self.handle_id_list(message);
            }
            "read_ack" => {
                self.handle_read_ack(sid.as_deref(), message, now);
            }
            // Heartbeat-style messages are handled by the generic sid and
            // token paths regardless of cmd.
            _ => {}
        }

        if let Some(sid) = &sid {
            self.registry.touch(sid, now);
            if *sid == self.gateway_sid
                && self.registry.is_live(&self.gateway_sid, now, self.online_timeout)
            {
                // Fast online detection; offline is left to the periodic tick.
                self.set_status(GatewayStatus::Online);
            }
        }

        processed.publish_sid = sid.unwrap_or_default();
        processed
    }

    /// Parse the nested-JSON id list and issue a `read` per device, plus one
    /// for the gateway itself to refresh its own status.
    fn handle_id_list(&mut self, message: &Value) -> Vec<String> {
        let mut outbound = Vec::new();

        match message.get("data").and_then(Value::as_str) {
            Some(data) => match serde_json::from_str::<Vec<String>>(data) {
                Ok(ids) => {
                    for sid in &ids {
                        outbound.push(Commands::read(sid));
                    }
                }
                Err(e) => {
                    tracing::warn!("Malformed device list in discovery ack: {}", e);
                }
            },
            None => {
                tracing::warn!("Discovery ack without data field");
            }
        }

        outbound.push(Commands::read(&self.gateway_sid));
        outbound
    }

    fn handle_read_ack(&mut self, sid: Option<&str>, message: &Value, now: Instant) {
        let Some(sid) = sid else {
            tracing::warn!("read_ack without sid");
            return;
        };
        let model = message.get("model").and_then(Value::as_str).unwrap_or("");

        if model::model_to_type(model).is_some() {
            self.registry.upsert(sid, model, message.clone(), now);
        } else {
            // Liveness for the sid is still recorded by the caller.
            tracing::warn!("Unknown discovered model: {}", model);
        }
    }

    fn set_status(&mut self, status: GatewayStatus) -> Option<GatewayStatus> {
        if self.status != status {
            self.status = status;
            Some(status)
        } else {
            None
        }
    }
}
