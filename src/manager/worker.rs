//! Per-device worker task
//!
//! Each device driver is moved into exactly one tokio task that owns it for
//! its whole life. All mutable driver state, timers and transport handles are
//! confined to that task; the rest of the gateway talks to it through a
//! command channel and a cancellation token.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::drivers::DeviceDriver;

/// Commands accepted by a device worker.
#[derive(Debug)]
pub enum DeviceCommand {
    /// Update a named parameter from text
    WriteParameter { key: String, value: String },
    /// Send verbatim text to the device (raw-socket variant)
    WriteRaw(String),
    /// Tear down and re-establish the device connection
    Reconnect,
    /// Stop the device and acknowledge once teardown finished
    Stop { ack: oneshot::Sender<()> },
}

/// Handle to a running device worker.
pub struct WorkerHandle {
    commands: mpsc::UnboundedSender<DeviceCommand>,
    token: CancellationToken,
    join: JoinHandle<Box<dyn DeviceDriver>>,
}

impl WorkerHandle {
    pub fn send(&self, command: DeviceCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request cancellation; the worker stops its driver and exits.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Give up the handle, keeping only the join future. Joining yields the
    /// driver back, so a later start reuses it instead of rebuilding.
    pub fn into_join(self) -> JoinHandle<Box<dyn DeviceDriver>> {
        self.join
    }
}

/// Spawn the owning task for a driver.
pub fn spawn_worker(driver: Box<dyn DeviceDriver>) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    let join = tokio::spawn(run_worker(driver, rx, token.clone()));
    WorkerHandle { commands: tx, token, join }
}

/// Drive one device until it is stopped or cancelled. Returns the driver so
/// the registry keeps it, with all its parameter state, across restarts.
async fn run_worker(
    mut driver: Box<dyn DeviceDriver>,
    mut commands: mpsc::UnboundedReceiver<DeviceCommand>,
    cancel: CancellationToken,
) -> Box<dyn DeviceDriver> {
    let device = driver.device_id().to_string();

    if let Err(e) = driver.init_in_worker().await {
        error!(device = %device, "worker init failed: {e}");
        return driver;
    }
    // First connection attempt; failures are logged by the driver and the
    // device stays reachable through Reconnect.
    driver.connect().await;
    info!(device = %device, "worker started");

    loop {
        // The poll future is dropped whenever a command or cancellation wins
        // the race; drivers keep any interrupted exchange queued and reissue
        // it on the next iteration.
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(device = %device, "worker cancelled");
                driver.stop().await;
                break;
            }

            command = commands.recv() => {
                match command {
                    Some(DeviceCommand::WriteParameter { key, value }) => {
                        driver.write_parameter(&key, &value).await;
                    }
                    Some(DeviceCommand::WriteRaw(text)) => {
                        driver.write_raw(&text).await;
                    }
                    Some(DeviceCommand::Reconnect) => {
                        driver.connect().await;
                    }
                    Some(DeviceCommand::Stop { ack }) => {
                        driver.stop().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        driver.stop().await;
                        break;
                    }
                }
            }

            _ = driver.poll_once() => {}
        }
    }

    info!(device = %device, "worker finished");
    driver
}
