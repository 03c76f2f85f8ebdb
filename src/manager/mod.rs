//! Device registry and lifecycle management
//!
//! The [`DeviceManager`] owns every configured device: registration
//! constructs the driver (and with it the register map, so structural errors
//! surface at `add_device`), starting hands the driver to a fresh worker
//! task, and stopping takes it back, parameter values included. Shutdown is
//! phased across all devices: request every stop and wait for the
//! acknowledgements, cancel every worker, then join each with a deadline.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::core::events::EventSender;
use crate::core::transport::TransportProvider;
use crate::drivers::{build_driver, DeviceDriver};
use crate::utils::error::{GatewayError, Result};

pub mod worker;

pub use worker::{DeviceCommand, WorkerHandle};

/// Deadline for one device's stop acknowledgement, and again for its join.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

struct DeviceEntry {
    config: Arc<DeviceConfig>,
    /// Constructed at registration, loaned to the worker while running and
    /// handed back on stop. `None` with no worker only after an abort lost
    /// the worker task together with the driver it owned.
    driver: Option<Box<dyn DeviceDriver>>,
    worker: Option<WorkerHandle>,
}

impl DeviceEntry {
    fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

pub struct DeviceManager {
    devices: HashMap<String, DeviceEntry>,
    /// Registration order, for deterministic iteration
    order: Vec<String>,
    provider: Arc<dyn TransportProvider>,
    events: EventSender,
}

impl DeviceManager {
    pub fn new(provider: Arc<dyn TransportProvider>, events: EventSender) -> Self {
        Self {
            devices: HashMap::new(),
            order: Vec::new(),
            provider,
            events,
        }
    }

    /// Register a device and construct its driver. Rejects an empty or
    /// duplicate id, and fails here, not at start, when the register table
    /// breaks a structural invariant.
    pub fn add_device(&mut self, config: DeviceConfig) -> Result<()> {
        if config.device_id.is_empty() {
            return Err(GatewayError::config("device id must not be empty"));
        }
        if self.devices.contains_key(&config.device_id) {
            return Err(GatewayError::config(format!(
                "duplicate device id: {}",
                config.device_id
            )));
        }
        let config = Arc::new(config);
        let driver = build_driver(config.clone(), self.provider.clone(), self.events.clone())?;
        info!(
            device = %config.device_id,
            protocol = config.protocol.as_str(),
            "device registered"
        );
        self.order.push(config.device_id.clone());
        self.devices.insert(
            config.device_id.clone(),
            DeviceEntry { config, driver: Some(driver), worker: None },
        );
        Ok(())
    }

    /// Remove a registered device. Refuses while its worker is running; stop
    /// it first.
    pub fn remove_device(&mut self, device_id: &str) -> Result<()> {
        let entry = self
            .devices
            .get(device_id)
            .ok_or_else(|| GatewayError::config(format!("unknown device: {device_id}")))?;
        if entry.is_running() {
            return Err(GatewayError::config(format!(
                "device {device_id} is running, stop it before removal"
            )));
        }
        self.devices.remove(device_id);
        self.order.retain(|id| id != device_id);
        info!(device = %device_id, "device removed");
        Ok(())
    }

    /// Configuration record of a registered device.
    pub fn get_device(&self, device_id: &str) -> Option<Arc<DeviceConfig>> {
        self.devices.get(device_id).map(|e| e.config.clone())
    }

    /// Registered device ids in registration order.
    pub fn device_ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn is_running(&self, device_id: &str) -> bool {
        self.devices.get(device_id).is_some_and(DeviceEntry::is_running)
    }

    /// Spawn the worker for a registered device, handing it the device's
    /// driver. Fails when it is already running.
    pub fn start_device(&mut self, device_id: &str) -> Result<()> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| GatewayError::config(format!("unknown device: {device_id}")))?;
        if entry.is_running() {
            return Err(GatewayError::config(format!(
                "device {device_id} is already running"
            )));
        }
        let driver = match entry.driver.take() {
            Some(driver) => driver,
            None => {
                // An aborted worker took the driver down with it; rebuild
                // from the configuration record.
                warn!(device = %device_id, "driver lost with aborted worker, rebuilding");
                build_driver(entry.config.clone(), self.provider.clone(), self.events.clone())?
            },
        };
        entry.worker = Some(worker::spawn_worker(driver));
        Ok(())
    }

    /// Start every registered device that is not already running.
    pub fn start_all(&mut self) -> Result<()> {
        for id in self.device_ids() {
            if !self.is_running(&id) {
                self.start_device(&id)?;
            }
        }
        Ok(())
    }

    /// Stop one device's worker with the ordered protocol: request the stop
    /// and wait for its acknowledgement, cancel, join with a deadline, abort
    /// as a last resort. The joined worker hands the driver back into the
    /// registry.
    pub async fn stop_device(&mut self, device_id: &str) -> Result<()> {
        let entry = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| GatewayError::config(format!("unknown device: {device_id}")))?;
        let Some(handle) = entry.worker.take() else {
            return Ok(());
        };

        request_stop(device_id, &handle).await;
        handle.cancel();
        let driver = join_worker(device_id, handle).await;

        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.driver = driver;
        }
        Ok(())
    }

    /// Stop every running worker with the phased protocol: request all stops
    /// and wait for the acknowledgements, cancel every worker, then join
    /// them concurrently, each with its own deadline.
    pub async fn shutdown(&mut self) {
        info!("stopping all devices");
        let mut stopping = Vec::new();
        for id in self.device_ids() {
            let handle = self.devices.get_mut(&id).and_then(|e| e.worker.take());
            if let Some(handle) = handle {
                stopping.push((id, handle));
            }
        }

        future::join_all(
            stopping
                .iter()
                .map(|(id, handle)| request_stop(id, handle)),
        )
        .await;

        for (_, handle) in &stopping {
            handle.cancel();
        }

        let joined = future::join_all(stopping.into_iter().map(|(id, handle)| async move {
            let driver = join_worker(&id, handle).await;
            (id, driver)
        }))
        .await;
        for (id, driver) in joined {
            if let Some(entry) = self.devices.get_mut(&id) {
                entry.driver = driver;
            }
        }
    }

    pub fn write_parameter(&self, device_id: &str, key: &str, value: &str) -> Result<()> {
        self.send_command(
            device_id,
            DeviceCommand::WriteParameter { key: key.to_string(), value: value.to_string() },
        )
    }

    pub fn write_raw(&self, device_id: &str, text: &str) -> Result<()> {
        self.send_command(device_id, DeviceCommand::WriteRaw(text.to_string()))
    }

    pub fn reconnect(&self, device_id: &str) -> Result<()> {
        self.send_command(device_id, DeviceCommand::Reconnect)
    }

    fn send_command(&self, device_id: &str, command: DeviceCommand) -> Result<()> {
        let entry = self
            .devices
            .get(device_id)
            .ok_or_else(|| GatewayError::config(format!("unknown device: {device_id}")))?;
        let sent = entry
            .worker
            .as_ref()
            .is_some_and(|w| w.send(command));
        if sent {
            Ok(())
        } else {
            Err(GatewayError::NotSupported(format!(
                "device {device_id} is not running"
            )))
        }
    }
}

/// Send the stop command and wait out its acknowledgement deadline.
async fn request_stop(device_id: &str, handle: &WorkerHandle) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if handle.send(DeviceCommand::Stop { ack: ack_tx }) {
        // A dead worker dropped its receiver; the cancel that follows
        // covers it.
        if timeout(STOP_TIMEOUT, ack_rx).await.is_err() {
            warn!(device = %device_id, "stop not acknowledged in time");
        }
    }
}

/// Join a cancelled worker with a deadline, aborting as a last resort and
/// waiting for the abort to land. Returns the driver the worker handed back,
/// or `None` when the task was aborted or panicked.
async fn join_worker(device_id: &str, handle: WorkerHandle) -> Option<Box<dyn DeviceDriver>> {
    let mut join = handle.into_join();
    match timeout(STOP_TIMEOUT, &mut join).await {
        Ok(Ok(driver)) => {
            info!(device = %device_id, "worker stopped");
            Some(driver)
        },
        Ok(Err(e)) => {
            warn!(device = %device_id, "worker join failed: {e}");
            None
        },
        Err(_) => {
            warn!(device = %device_id, "worker did not finish, aborting");
            join.abort();
            let _ = join.await;
            None
        },
    }
}
