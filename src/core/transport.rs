//! Transport collaborator interfaces
//!
//! The gateway core never touches the wire. Framing, CRC, response timeout
//! and retry all belong to the transport collaborators defined here; the core
//! exchanges whole register blocks, raw byte frames, or motion-card calls
//! through these traits. Concrete implementations (serial Modbus master, TCP
//! socket, vendor motion SDK) are supplied by the embedding application
//! through a [`TransportProvider`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::DeviceConfig;
use crate::core::register_map::{RegisterKind, RegisterSpan};

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped while in use
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation attempted without a connection
    #[error("Not connected")]
    NotConnected,

    /// The collaborator's configured response timeout (and retries) elapsed
    #[error("Response timed out after {0} ms")]
    Timeout(u64),

    /// Protocol-level exception from the remote device
    #[error("Protocol exception: {0:#04x}")]
    Protocol(u8),

    /// Underlying IO error
    #[error("IO error: {0}")]
    Io(String),
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Register-block exchange with a Modbus-family device.
///
/// One request is in flight at a time per device; the scheduler enforces
/// that, so implementations may assume strictly serialized calls.
#[async_trait]
pub trait RegisterTransport: Send {
    /// Declare the consolidated address windows this device will touch, one
    /// contiguous span per register kind. Called once before `connect`.
    fn declare_spans(&mut self, spans: &[RegisterSpan]);

    /// Establish the connection. Retries and timeouts are the
    /// implementation's own concern.
    async fn connect(&mut self) -> TransportResult<()>;

    /// Tear the connection down. Safe to call when already disconnected.
    async fn disconnect(&mut self);

    /// Read `count` consecutive registers starting at `address`.
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>>;

    /// Write consecutive registers starting at `address`.
    async fn write_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        values: &[u16],
    ) -> TransportResult<()>;
}

/// Raw byte-stream link for the text-over-TCP device variant.
///
/// Inbound bytes are delivered through the receiver handed back by
/// `connect`; the link owns the socket and its read loop.
#[async_trait]
pub trait RawLink: Send {
    async fn connect(&mut self) -> TransportResult<mpsc::Receiver<Bytes>>;

    async fn disconnect(&mut self);

    async fn send(&mut self, payload: &[u8]) -> TransportResult<()>;
}

/// Motion-control card collaborator (vendor SDK boundary).
#[async_trait]
pub trait MotionController: Send {
    async fn open(&mut self) -> TransportResult<()>;

    async fn close(&mut self);

    async fn set_speed(&mut self, axis: u8, speed: f64) -> TransportResult<()>;

    /// Absolute move of one axis to `position`.
    async fn move_absolute(&mut self, axis: u8, position: f64) -> TransportResult<()>;

    /// Relative move of one axis by `distance`.
    async fn move_relative(&mut self, axis: u8, distance: f64) -> TransportResult<()>;

    /// Decelerate-and-cancel the axis motion.
    async fn cancel(&mut self, axis: u8) -> TransportResult<()>;

    async fn set_output(&mut self, output: u8, on: bool) -> TransportResult<()>;

    async fn input(&mut self, input: u8) -> TransportResult<bool>;

    async fn axis_position(&mut self, axis: u8) -> TransportResult<f64>;

    /// True when the axis has no motion in progress.
    async fn axis_idle(&mut self, axis: u8) -> TransportResult<bool>;
}

/// Factory mapping a device configuration to its transport collaborator.
///
/// Called only inside the device's worker context, never at registration
/// time: transport handles live and die with the worker that drives them.
pub trait TransportProvider: Send + Sync {
    fn register_transport(
        &self,
        config: &DeviceConfig,
    ) -> TransportResult<Box<dyn RegisterTransport>>;

    fn raw_link(&self, config: &DeviceConfig) -> TransportResult<Box<dyn RawLink>>;

    fn motion_controller(
        &self,
        config: &DeviceConfig,
    ) -> TransportResult<Box<dyn MotionController>>;
}
