//! Events crossing the bus boundary and the fleet boundary

use bench_shared::{now_ms, topics, DeviceRecord, GroupedInventory};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One message arriving from the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// `true` only for a payload whose `value` is the boolean `true`
    pub fn is_true(&self) -> bool {
        self.payload.get("value") == Some(&Value::Bool(true))
    }
}

/// One message leaving for the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub topic: String,
    pub payload: Value,
}

impl OutboundEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Emitted by the fleet supervisor and its workers
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    /// A query answered by a device
    Response {
        key: String,
        address: String,
        command: String,
        response: String,
        correlation_id: String,
    },
    /// A command that could not be delivered or executed
    Error {
        key: String,
        address: String,
        message: String,
        command: String,
    },
    /// Connection status of a device changed
    Status {
        key: String,
        address: String,
        status: String,
    },
    /// A scan finished; the full record set in scan order
    Inventory(Vec<DeviceRecord>),
}

impl FleetEvent {
    /// Bus rendering of the event
    pub fn to_outbound(&self) -> OutboundEvent {
        let ts = now_ms();
        match self {
            FleetEvent::Response {
                key,
                command,
                response,
                correlation_id,
                ..
            } => OutboundEvent::new(
                topics::device_topic(key, "Rx_Outbox"),
                json!({
                    "response": response,
                    "command": command,
                    "correlation_id": correlation_id,
                    "timestamp": ts,
                }),
            ),
            FleetEvent::Error {
                key,
                address,
                message,
                command,
            } => OutboundEvent::new(
                topics::device_topic(key, "Error"),
                json!({
                    "error": message,
                    "address": address,
                    "command": command,
                    "timestamp": ts,
                }),
            ),
            FleetEvent::Status {
                key,
                address,
                status,
            } => OutboundEvent::new(
                topics::device_topic(key, "Proxy_Status"),
                json!({ "status": status, "address": address, "ts": ts }),
            ),
            FleetEvent::Inventory(records) => inventory_event(&bench_shared::device::group_by_type_and_model(records)),
        }
    }
}

pub fn inventory_event(grouped: &GroupedInventory) -> OutboundEvent {
    OutboundEvent::new(
        topics::INVENTORY,
        serde_json::to_value(grouped).unwrap_or(Value::Null),
    )
}
