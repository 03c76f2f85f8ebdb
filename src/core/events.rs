//! Outbound event stream
//!
//! Every driver publishes its observations here: parameter value changes,
//! connection state transitions and raw wire frames. Consumers (the data
//! aggregator, presentation layers) subscribe to the channel; drivers never
//! call back into them.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

/// Parameter value payload. Register-backed devices publish unsigned
/// integers; the raw-socket variant publishes text tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Unsigned(u64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        Self::Unsigned(v)
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Events published by device workers
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A parameter's current value changed
    ParameterChanged {
        device_id: String,
        key: String,
        value: ParamValue,
        timestamp: DateTime<Utc>,
    },
    /// A device's connection state flipped
    ConnectionChanged { device_id: String, connected: bool },
    /// Raw bytes crossed the wire; consumed only by presentation layers
    RawFrame {
        device_id: String,
        payload: Bytes,
        outbound: bool,
    },
}

/// Sender half of the gateway event stream
pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;

/// Receiver half of the gateway event stream
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

/// Create the event channel pair.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Publish helpers shared by the drivers.
pub(crate) fn publish_parameter(
    events: &EventSender,
    device_id: &str,
    key: &str,
    value: impl Into<ParamValue>,
) {
    let _ = events.send(GatewayEvent::ParameterChanged {
        device_id: device_id.to_string(),
        key: key.to_string(),
        value: value.into(),
        timestamp: Utc::now(),
    });
}

pub(crate) fn publish_connection(events: &EventSender, device_id: &str, connected: bool) {
    let _ = events.send(GatewayEvent::ConnectionChanged {
        device_id: device_id.to_string(),
        connected,
    });
}

pub(crate) fn publish_raw_frame(
    events: &EventSender,
    device_id: &str,
    payload: Bytes,
    outbound: bool,
) {
    let _ = events.send(GatewayEvent::RawFrame {
        device_id: device_id.to_string(),
        payload,
        outbound,
    });
}
