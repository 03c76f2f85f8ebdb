//! Modbus-family driver (RTU and TCP)
//!
//! One generic driver covers both Modbus variants: the register model and
//! polling machinery are identical, and the differences (serial master vs.
//! TCP client, frame pacing) live in the transport provider and the device
//! configuration. The register map is built once at construction; the
//! transport handle is created later, inside the owning worker task.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tracing::{info, warn};

use super::{DeviceDriver, DriverBase};
use crate::config::{DeviceConfig, Protocol};
use crate::core::events::EventSender;
use crate::core::register_map::RegisterMap;
use crate::core::scheduler::PollScheduler;
use crate::core::transport::{ConnectionState, RegisterTransport, TransportProvider};
use crate::utils::error::Result;

pub struct ModbusDevice {
    base: DriverBase,
    provider: Arc<dyn TransportProvider>,
    map: RegisterMap,
    scheduler: PollScheduler,
    /// Created in `init_in_worker`, released by `stop`
    transport: Option<Box<dyn RegisterTransport>>,
}

impl ModbusDevice {
    /// Build the driver and its register map from configuration. No I/O.
    pub fn new(
        config: Arc<DeviceConfig>,
        provider: Arc<dyn TransportProvider>,
        events: EventSender,
    ) -> Result<Self> {
        let map = RegisterMap::from_registers(&config.registers, config.modbus_offset)?;
        let scheduler = PollScheduler::new(config.frame_interval());
        Ok(Self {
            base: DriverBase::new(config, events),
            provider,
            map,
            scheduler,
            transport: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn map(&self) -> &RegisterMap {
        &self.map
    }
}

#[async_trait]
impl DeviceDriver for ModbusDevice {
    fn device_id(&self) -> &str {
        &self.base.config.device_id
    }

    fn device_name(&self) -> &str {
        &self.base.config.device_name
    }

    fn protocol(&self) -> Protocol {
        self.base.config.protocol
    }

    fn config(&self) -> &DeviceConfig {
        &self.base.config
    }

    fn connection_state(&self) -> ConnectionState {
        self.base.state
    }

    async fn init_in_worker(&mut self) -> Result<()> {
        let mut transport = self.provider.register_transport(&self.base.config)?;
        // Declare the consolidated address windows once, before any exchange.
        transport.declare_spans(&self.map.spans());
        self.transport = Some(transport);
        Ok(())
    }

    async fn connect(&mut self) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            warn!(device = %self.base.config.device_id, "connect before init_in_worker");
            return false;
        };

        // Re-connectable: tear down any previous link first.
        if self.base.state != ConnectionState::Disconnected {
            transport.disconnect().await;
            self.scheduler.stop();
        }
        self.base.set_state(ConnectionState::Connecting);

        match transport.connect().await {
            Ok(()) => {
                self.base.set_state(ConnectionState::Connected);
                self.scheduler.start();
                info!(
                    device = %self.base.config.device_id,
                    protocol = self.base.config.protocol.as_str(),
                    "connected, polling started"
                );
                true
            },
            Err(e) => {
                self.base.set_state(ConnectionState::Disconnected);
                warn!(device = %self.base.config.device_id, "connect failed: {e}");
                false
            },
        }
    }

    async fn disconnect(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect().await;
        }
        self.scheduler.stop();
        self.base.set_state(ConnectionState::Disconnected);
    }

    async fn write_parameter(&mut self, key: &str, value_text: &str) {
        if self.map.key_index_of(key).is_none() {
            warn!(device = %self.base.config.device_id, %key, "write to unknown key");
            return;
        }
        // Unparsable values leave the current value untouched.
        if let Ok(value) = value_text.parse::<u64>() {
            self.map.set_value(key, value);
        }
    }

    async fn poll_once(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            future::pending::<()>().await;
            return;
        };
        self.scheduler
            .run_cycle(
                &mut self.map,
                transport.as_mut(),
                &self.base.events,
                &self.base.config.device_id,
            )
            .await;
    }

    async fn stop(&mut self) {
        self.scheduler.stop();
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.base.set_state(ConnectionState::Disconnected);
    }
}
