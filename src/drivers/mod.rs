//! Protocol-specific device drivers
//!
//! Every driver implements the [`DeviceDriver`] capability set and lives
//! inside one worker task that owns its mutable state, timers and transport
//! handle. Variants are selected once at construction by the protocol
//! discriminator; the shared polling machinery lives in [`crate::core`] and
//! is composed into the drivers rather than inherited.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{DeviceConfig, Protocol};
use crate::core::events::EventSender;
use crate::core::transport::{ConnectionState, TransportProvider};
use crate::utils::error::Result;

pub mod modbus;
pub mod motion;
pub mod raw_tcp;

pub use modbus::ModbusDevice;
pub use motion::MotionDevice;
pub use raw_tcp::RawTcpDevice;

/// Capability set every concrete driver implements.
///
/// All methods run inside the device's owning worker task. Failures never
/// cross this boundary as errors: they surface through connection-state
/// changes, log lines, or silently absent effects, so one device's trouble
/// cannot take down another.
#[async_trait]
pub trait DeviceDriver: Send {
    fn device_id(&self) -> &str;

    fn device_name(&self) -> &str;

    fn protocol(&self) -> Protocol;

    /// Read-only view of the immutable configuration record.
    fn config(&self) -> &DeviceConfig;

    fn connection_state(&self) -> ConnectionState;

    /// One-time creation of transport handles and timer state. Must run
    /// inside the owning worker task; these objects are not safely
    /// constructed or used cross-context.
    async fn init_in_worker(&mut self) -> Result<()>;

    /// Establish the device connection. The final outcome surfaces through
    /// a connection-state change event.
    async fn connect(&mut self) -> bool;

    async fn disconnect(&mut self);

    /// Update a named parameter from text. An unknown key logs a warning and
    /// returns without effect; an unparsable unsigned value silently leaves
    /// the current value unchanged.
    async fn write_parameter(&mut self, key: &str, value_text: &str);

    /// Send verbatim text to the device. Only meaningful for the raw-socket
    /// variant; the default logs and drops the text.
    async fn write_raw(&mut self, text: &str) {
        debug!(
            device = self.device_id(),
            "write_raw not supported by {} driver, dropped: {text}",
            self.protocol().as_str()
        );
    }

    /// Drive one polling/status cycle. Pends indefinitely while the device
    /// is idle; the worker parks this future in its select loop and drops it
    /// whenever a command arrives.
    async fn poll_once(&mut self);

    /// Idempotent teardown of timers and transport handles. Safe to call
    /// repeatedly; the worker acknowledges a stop request only after this
    /// returns.
    async fn stop(&mut self);
}

/// Construct the concrete driver for a configuration record.
///
/// Pure object construction: no I/O happens here. Transport handles are
/// created later by `init_in_worker` inside the owning worker task.
pub fn build_driver(
    config: Arc<DeviceConfig>,
    provider: Arc<dyn TransportProvider>,
    events: EventSender,
) -> Result<Box<dyn DeviceDriver>> {
    match config.protocol {
        Protocol::ModbusRtu | Protocol::ModbusTcp => {
            Ok(Box::new(ModbusDevice::new(config, provider, events)?))
        },
        Protocol::TcpSocket => Ok(Box::new(RawTcpDevice::new(config, provider, events))),
        Protocol::Motion => Ok(Box::new(MotionDevice::new(config, provider, events))),
    }
}

/// Shared identity/state block embedded in every driver.
#[derive(Debug)]
pub(crate) struct DriverBase {
    pub config: Arc<DeviceConfig>,
    pub events: EventSender,
    pub state: ConnectionState,
}

impl DriverBase {
    pub fn new(config: Arc<DeviceConfig>, events: EventSender) -> Self {
        Self {
            config,
            events,
            state: ConnectionState::Disconnected,
        }
    }

    /// Record a state transition, publishing `ConnectionChanged` only when
    /// the connected flag actually flips.
    pub fn set_state(&mut self, state: ConnectionState) {
        let was_connected = self.state.is_connected();
        let now_connected = state.is_connected();
        self.state = state;
        if was_connected != now_connected {
            crate::core::events::publish_connection(
                &self.events,
                &self.config.device_id,
                now_connected,
            );
        }
    }
}
