//! Full device lifecycle tests against the in-process simulators.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gatesrv::config::DeviceConfig;
use gatesrv::core::aggregator::DataAggregator;
use gatesrv::core::events::{event_channel, ParamValue};
use gatesrv::core::register_map::{RegisterKind, RegisterSpan};
use gatesrv::core::transport::{
    ConnectionState, MotionController, RawLink, RegisterTransport, TransportError,
    TransportProvider, TransportResult,
};
use gatesrv::drivers::DeviceDriver;
use gatesrv::manager::worker::{spawn_worker, DeviceCommand};
use gatesrv::manager::DeviceManager;
use gatesrv::sim::SimProvider;
use gatesrv::{GatewayConfig, Protocol};
use tokio::sync::oneshot;

fn modbus_config(id: &str) -> DeviceConfig {
    serde_yaml::from_str(&format!(
        r#"
device_id: {id}
device_name: Test Unit
protocol: modbus_tcp
frame_interval_ms: 1
registers:
  - {{ address: 100, key: status, length: 16, access: read }}
  - {{ address: 101, key: setpoint, length: 16, access: readwrite }}
"#
    ))
    .unwrap()
}

fn raw_config(id: &str) -> DeviceConfig {
    serde_yaml::from_str(&format!(
        r#"
device_id: {id}
protocol: tcp_socket
registers:
  - {{ address: 0, key: speed, length: 16, command: SPEED }}
"#
    ))
    .unwrap()
}

/// Poll `check` until it passes or the deadline expires.
async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}

#[tokio::test]
async fn modbus_device_polls_and_writes_through_manager() {
    let provider = Arc::new(SimProvider::new());
    let bank = provider.bank();
    bank.set(RegisterKind::HoldingRegister, 100, 0x1234);

    let (events, event_rx) = event_channel();
    let aggregator = DataAggregator::new();
    aggregator.start(event_rx);

    let mut manager = DeviceManager::new(provider, events);
    manager.add_device(modbus_config("dev1")).unwrap();
    manager.start_device("dev1").unwrap();

    // The read group lands in the aggregator.
    let agg = aggregator.clone();
    wait_for(move || agg.value("dev1", "status") == Some(ParamValue::Unsigned(0x1234))).await;
    assert_eq!(aggregator.is_connected("dev1"), Some(true));

    // A parameter write reaches the register bank on a later sweep.
    manager.write_parameter("dev1", "setpoint", "77").unwrap();
    let b = bank.clone();
    wait_for(move || b.get(RegisterKind::HoldingRegister, 101) == 77).await;

    manager.stop_device("dev1").await.unwrap();
    assert!(!manager.is_running("dev1"));
    assert!(manager.write_parameter("dev1", "setpoint", "1").is_err());
}

#[tokio::test]
async fn restart_keeps_written_values_authoritative() {
    let provider = Arc::new(SimProvider::new());
    let bank = provider.bank();

    let (events, event_rx) = event_channel();
    let aggregator = DataAggregator::new();
    aggregator.start(event_rx);

    let mut manager = DeviceManager::new(provider, events);
    manager.add_device(modbus_config("dev1")).unwrap();
    manager.start_device("dev1").unwrap();

    manager.write_parameter("dev1", "setpoint", "77").unwrap();
    let b = bank.clone();
    wait_for(move || b.get(RegisterKind::HoldingRegister, 101) == 77).await;

    // Stop and restart: the driver, and with it the locally authoritative
    // setpoint, survives in the registry.
    manager.stop_device("dev1").await.unwrap();
    let agg = aggregator.clone();
    wait_for(move || agg.is_connected("dev1") == Some(false)).await;
    manager.start_device("dev1").unwrap();

    // Wait until the restarted worker demonstrably completed a read sweep.
    bank.set(RegisterKind::HoldingRegister, 100, 0x0042);
    let agg = aggregator.clone();
    wait_for(move || agg.value("dev1", "status") == Some(ParamValue::Unsigned(0x0042))).await;

    // Write sweeps after the restart must re-assert 77, never drive the
    // register back to a default.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(bank.get(RegisterKind::HoldingRegister, 101), 77);

    manager.shutdown().await;
}

#[tokio::test]
async fn raw_device_echo_round_trip() {
    let provider = Arc::new(SimProvider::new());
    let (events, event_rx) = event_channel();
    let aggregator = DataAggregator::new();
    aggregator.start(event_rx);

    let mut manager = DeviceManager::new(provider, events);
    manager.add_device(raw_config("jgt1")).unwrap();
    manager.start_device("jgt1").unwrap();

    let agg = aggregator.clone();
    wait_for(move || agg.is_connected("jgt1") == Some(true)).await;

    // The simulator echoes the encoded frame, which parses back to the key.
    manager.write_parameter("jgt1", "speed", "42").unwrap();
    let agg = aggregator.clone();
    wait_for(move || agg.value("jgt1", "speed") == Some(ParamValue::Text("42".into()))).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn remove_refused_while_running() {
    let provider = Arc::new(SimProvider::new());
    let (events, _rx) = event_channel();
    let mut manager = DeviceManager::new(provider, events);

    manager.add_device(modbus_config("dev1")).unwrap();
    manager.start_device("dev1").unwrap();
    assert!(manager.remove_device("dev1").is_err());

    manager.stop_device("dev1").await.unwrap();
    manager.remove_device("dev1").unwrap();
    assert!(manager.get_device("dev1").is_none());
}

/// Driver double that records how often it was stopped.
struct CountingDriver {
    config: Arc<DeviceConfig>,
    stops: Arc<Mutex<u32>>,
}

#[async_trait]
impl DeviceDriver for CountingDriver {
    fn device_id(&self) -> &str {
        &self.config.device_id
    }

    fn device_name(&self) -> &str {
        &self.config.device_name
    }

    fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    async fn init_in_worker(&mut self) -> gatesrv::Result<()> {
        Ok(())
    }

    async fn connect(&mut self) -> bool {
        true
    }

    async fn disconnect(&mut self) {}

    async fn write_parameter(&mut self, _key: &str, _value: &str) {}

    async fn poll_once(&mut self) {
        futures::future::pending::<()>().await;
    }

    async fn stop(&mut self) {
        *self.stops.lock().unwrap() += 1;
    }
}

#[tokio::test]
async fn stop_runs_once_and_strictly_before_join() {
    let stops = Arc::new(Mutex::new(0));
    let driver = CountingDriver {
        config: Arc::new(modbus_config("counted")),
        stops: stops.clone(),
    };
    let handle = spawn_worker(Box::new(driver));

    let (ack_tx, ack_rx) = oneshot::channel();
    assert!(handle.send(DeviceCommand::Stop { ack: ack_tx }));

    // The acknowledgement arrives only after the driver's stop finished.
    ack_rx.await.unwrap();
    assert_eq!(*stops.lock().unwrap(), 1);

    handle.cancel();
    let mut join = handle.into_join();
    tokio::time::timeout(Duration::from_secs(3), &mut join)
        .await
        .expect("worker did not finish")
        .unwrap();
    assert_eq!(*stops.lock().unwrap(), 1);
}

/// Transport that answers reads and writes instantly but never finishes
/// disconnecting, wedging the driver's teardown.
struct WedgedTransport;

#[async_trait]
impl RegisterTransport for WedgedTransport {
    fn declare_spans(&mut self, _spans: &[RegisterSpan]) {}

    async fn connect(&mut self) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) {
        futures::future::pending::<()>().await;
    }

    async fn read_registers(
        &mut self,
        _kind: RegisterKind,
        _address: u16,
        count: u16,
    ) -> TransportResult<Vec<u16>> {
        Ok(vec![0; count as usize])
    }

    async fn write_registers(
        &mut self,
        _kind: RegisterKind,
        _address: u16,
        _values: &[u16],
    ) -> TransportResult<()> {
        Ok(())
    }
}

struct WedgedProvider;

impl TransportProvider for WedgedProvider {
    fn register_transport(
        &self,
        _config: &DeviceConfig,
    ) -> TransportResult<Box<dyn RegisterTransport>> {
        Ok(Box::new(WedgedTransport))
    }

    fn raw_link(&self, _config: &DeviceConfig) -> TransportResult<Box<dyn RawLink>> {
        Err(TransportError::ConnectionFailed("unavailable".into()))
    }

    fn motion_controller(
        &self,
        _config: &DeviceConfig,
    ) -> TransportResult<Box<dyn MotionController>> {
        Err(TransportError::ConnectionFailed("unavailable".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn wedged_worker_is_aborted_and_fully_reaped() {
    // A driver stuck in teardown misses the ack deadline and the join
    // deadline; stop_device must abort the task, wait the abort out, and
    // leave the device restartable.
    let (events, _rx) = event_channel();
    let mut manager = DeviceManager::new(Arc::new(WedgedProvider), events);
    manager.add_device(modbus_config("dev1")).unwrap();
    manager.start_device("dev1").unwrap();

    manager.stop_device("dev1").await.unwrap();
    assert!(!manager.is_running("dev1"));

    // The driver went down with the aborted task; starting again rebuilds it.
    manager.start_device("dev1").unwrap();
    manager.shutdown().await;
    assert!(!manager.is_running("dev1"));
}

#[tokio::test]
async fn config_drives_full_startup() {
    use std::io::Write;

    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
service:
  name: gatesrv-test
devices:
  - device_id: dev1
    protocol: modbus_tcp
    frame_interval_ms: 1
    registers:
      - {{ address: 5, key: mode, length: 16, access: read }}
  - device_id: zm1
    protocol: motion
    axes:
      - {{ id: 0, enabled: true }}
"#
    )
    .unwrap();

    let config = GatewayConfig::from_file(file.path()).unwrap();
    let provider = Arc::new(SimProvider::new());
    let (events, event_rx) = event_channel();
    let aggregator = DataAggregator::new();
    aggregator.start(event_rx);

    let mut manager = DeviceManager::new(provider, events);
    for device in config.devices {
        manager.add_device(device).unwrap();
    }
    manager.start_all().unwrap();

    let agg = aggregator.clone();
    wait_for(move || {
        agg.is_connected("dev1") == Some(true) && agg.is_connected("zm1") == Some(true)
    })
    .await;

    manager.shutdown().await;
    assert!(!manager.is_running("dev1"));
    assert!(!manager.is_running("zm1"));
}
