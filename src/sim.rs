//! In-process device simulators
//!
//! A [`SimProvider`] stands in for real wire transports: a shared register
//! bank for the Modbus variants, an echoing byte link for the raw-socket
//! variant and an instant-settling motion card. The binary falls back to it
//! when no hardware is reachable, and the integration tests drive full device
//! lifecycles through it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::core::register_map::{RegisterKind, RegisterSpan};
use crate::core::transport::{
    MotionController, RawLink, RegisterTransport, TransportError, TransportProvider,
    TransportResult,
};

/// Shared register bank, addressable by kind and address.
#[derive(Debug, Default)]
pub struct RegisterBank {
    cells: Mutex<HashMap<(RegisterKind, u16), u16>>,
}

impl RegisterBank {
    pub fn set(&self, kind: RegisterKind, address: u16, value: u16) {
        self.cells.lock().insert((kind, address), value);
    }

    pub fn get(&self, kind: RegisterKind, address: u16) -> u16 {
        self.cells.lock().get(&(kind, address)).copied().unwrap_or(0)
    }
}

/// Register transport reading and writing a shared [`RegisterBank`].
pub struct SimRegisterTransport {
    bank: Arc<RegisterBank>,
    spans: Vec<RegisterSpan>,
    connected: bool,
}

#[async_trait]
impl RegisterTransport for SimRegisterTransport {
    fn declare_spans(&mut self, spans: &[RegisterSpan]) {
        self.spans = spans.to_vec();
    }

    async fn connect(&mut self) -> TransportResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        // A real server answers out-of-window reads with an illegal data
        // address exception; the simulator does the same once spans were
        // declared.
        let in_window = self.spans.is_empty()
            || self.spans.iter().any(|s| {
                s.kind == kind && address >= s.start && address + count <= s.start + s.count
            });
        if !in_window {
            return Err(TransportError::Protocol(0x02));
        }
        Ok((0..count).map(|i| self.bank.get(kind, address + i)).collect())
    }

    async fn write_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        values: &[u16],
    ) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        for (i, value) in values.iter().enumerate() {
            self.bank.set(kind, address + i as u16, *value);
        }
        Ok(())
    }
}

/// Byte link that echoes every sent frame straight back.
pub struct SimRawLink {
    inbound: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl RawLink for SimRawLink {
    async fn connect(&mut self) -> TransportResult<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(64);
        self.inbound = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&mut self) {
        self.inbound = None;
    }

    async fn send(&mut self, payload: &[u8]) -> TransportResult<()> {
        let Some(tx) = self.inbound.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        tx.send(Bytes::copy_from_slice(payload))
            .await
            .map_err(|_| TransportError::ConnectionLost("echo link closed".into()))
    }
}

#[derive(Debug, Default)]
struct SimAxis {
    position: f64,
    speed: f64,
}

/// Motion card whose moves settle instantly.
#[derive(Default)]
pub struct SimMotionController {
    axes: HashMap<u8, SimAxis>,
    outputs: HashMap<u8, bool>,
    open: bool,
}

#[async_trait]
impl MotionController for SimMotionController {
    async fn open(&mut self) -> TransportResult<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.open = false;
    }

    async fn set_speed(&mut self, axis: u8, speed: f64) -> TransportResult<()> {
        self.axes.entry(axis).or_default().speed = speed;
        Ok(())
    }

    async fn move_absolute(&mut self, axis: u8, position: f64) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        self.axes.entry(axis).or_default().position = position;
        Ok(())
    }

    async fn move_relative(&mut self, axis: u8, distance: f64) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        self.axes.entry(axis).or_default().position += distance;
        Ok(())
    }

    async fn cancel(&mut self, _axis: u8) -> TransportResult<()> {
        Ok(())
    }

    async fn set_output(&mut self, output: u8, on: bool) -> TransportResult<()> {
        self.outputs.insert(output, on);
        Ok(())
    }

    async fn input(&mut self, input: u8) -> TransportResult<bool> {
        // Outputs are looped back to the same-numbered inputs.
        Ok(self.outputs.get(&input).copied().unwrap_or(false))
    }

    async fn axis_position(&mut self, axis: u8) -> TransportResult<f64> {
        Ok(self.axes.get(&axis).map(|a| a.position).unwrap_or(0.0))
    }

    async fn axis_idle(&mut self, _axis: u8) -> TransportResult<bool> {
        Ok(true)
    }
}

/// Provider wiring every protocol to its simulator. All register devices
/// share one bank per provider, so tests can observe writes and preload
/// reads.
#[derive(Default)]
pub struct SimProvider {
    bank: Arc<RegisterBank>,
}

impl SimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The register bank backing every simulated register device.
    pub fn bank(&self) -> Arc<RegisterBank> {
        self.bank.clone()
    }
}

impl TransportProvider for SimProvider {
    fn register_transport(
        &self,
        config: &DeviceConfig,
    ) -> TransportResult<Box<dyn RegisterTransport>> {
        debug!(device = %config.device_id, "simulated register transport");
        Ok(Box::new(SimRegisterTransport {
            bank: self.bank.clone(),
            spans: Vec::new(),
            connected: false,
        }))
    }

    fn raw_link(&self, config: &DeviceConfig) -> TransportResult<Box<dyn RawLink>> {
        debug!(device = %config.device_id, "simulated raw link");
        Ok(Box::new(SimRawLink { inbound: None }))
    }

    fn motion_controller(
        &self,
        config: &DeviceConfig,
    ) -> TransportResult<Box<dyn MotionController>> {
        debug!(device = %config.device_id, "simulated motion controller");
        Ok(Box::new(SimMotionController::default()))
    }
}
