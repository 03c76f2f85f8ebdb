//! Cross-device data aggregator
//!
//! Mirrors every published parameter value into one reader/writer-locked map
//! so presentation layers can read without blocking each other or any device
//! worker. The aggregator only ever consumes events; it never reaches into a
//! device's register map.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::{EventReceiver, GatewayEvent, ParamValue};

#[derive(Default)]
struct AggregatorState {
    /// device id -> key -> latest value
    values: HashMap<String, HashMap<String, ParamValue>>,
    /// device id -> last reported connection flag
    connected: HashMap<String, bool>,
}

/// Shared, read-mostly view of every device's latest published values.
#[derive(Clone, Default)]
pub struct DataAggregator {
    state: Arc<RwLock<AggregatorState>>,
}

impl DataAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the consumer task draining the event stream into the map.
    /// The task ends when every event sender is dropped.
    pub fn start(&self, mut events: EventReceiver) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    GatewayEvent::ParameterChanged { device_id, key, value, .. } => {
                        debug!(device = %device_id, %key, %value, "parameter changed");
                        state
                            .write()
                            .values
                            .entry(device_id)
                            .or_default()
                            .insert(key, value);
                    },
                    GatewayEvent::ConnectionChanged { device_id, connected } => {
                        state.write().connected.insert(device_id, connected);
                    },
                    // Raw frames are presentation-only; nothing to keep here.
                    GatewayEvent::RawFrame { .. } => {},
                }
            }
        })
    }

    /// Latest value of one parameter.
    pub fn value(&self, device_id: &str, key: &str) -> Option<ParamValue> {
        self.state
            .read()
            .values
            .get(device_id)
            .and_then(|m| m.get(key))
            .cloned()
    }

    /// Snapshot of every parameter of one device.
    pub fn device_values(&self, device_id: &str) -> HashMap<String, ParamValue> {
        self.state
            .read()
            .values
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Last reported connection flag of one device, if any was published.
    pub fn is_connected(&self, device_id: &str) -> Option<bool> {
        self.state.read().connected.get(device_id).copied()
    }

    /// JSON snapshot of one device's values, for presentation layers.
    pub fn device_values_json(&self, device_id: &str) -> serde_json::Value {
        serde_json::to_value(self.device_values(device_id)).unwrap_or_default()
    }
}
