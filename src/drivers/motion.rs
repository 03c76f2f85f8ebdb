//! Motion-card driver
//!
//! Drives a multi-axis motion controller through the [`MotionController`]
//! collaborator. Instead of register polling it runs a periodic status sweep
//! over the enabled axes and the digital IO bank, and interprets parameter
//! writes as a small command grammar (`axis0_move_abs`, `output3`,
//! `stop_all`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use super::{DeviceDriver, DriverBase};
use crate::config::{DeviceConfig, Protocol};
use crate::core::events::{publish_parameter, EventSender};
use crate::core::transport::{ConnectionState, MotionController, TransportProvider};
use crate::utils::error::Result;

/// Position delta below which a status sweep publishes nothing.
const POSITION_EPSILON: f64 = 0.001;

/// Number of digital inputs scanned per sweep.
const INPUT_COUNT: u8 = 16;

const DEFAULT_SPEED: f64 = 10.0;

/// One parsed motion command.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MotionCommand {
    MoveAbsolute { axis: u8, position: f64, speed: f64 },
    MoveRelative { axis: u8, distance: f64, speed: f64 },
    StopAxis(u8),
    HomeAxis(u8),
    SetOutput { output: u8, on: bool },
    StopAll,
}

/// Parse a `key` / `value` pair into a motion command.
///
/// Axis commands are keyed `axis<N>_move_abs`, `axis<N>_move_rel`,
/// `axis<N>_stop` and `axis<N>_home`; move values are `position[,speed]`.
/// IO commands are keyed `output<N>` with a truthy value of `1`, `true` or
/// `on`. `stop_all` takes no value. Anything else is `None`.
pub(crate) fn parse_command(key: &str, value: &str) -> Option<MotionCommand> {
    if key == "stop_all" {
        return Some(MotionCommand::StopAll);
    }
    if let Some(id) = key.strip_prefix("output") {
        let output = id.parse::<u8>().ok()?;
        let on = matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on");
        return Some(MotionCommand::SetOutput { output, on });
    }

    let mut parts = key.split('_');
    let axis = parts.next()?.strip_prefix("axis")?.parse::<u8>().ok()?;
    match (parts.next()?, parts.next()) {
        ("move", Some(kind)) => {
            let mut values = value.split(',');
            let target = values.next()?.trim().parse::<f64>().ok()?;
            let speed = match values.next() {
                Some(s) => s.trim().parse::<f64>().ok()?,
                None => DEFAULT_SPEED,
            };
            match kind {
                "abs" => Some(MotionCommand::MoveAbsolute { axis, position: target, speed }),
                "rel" => Some(MotionCommand::MoveRelative { axis, distance: target, speed }),
                _ => None,
            }
        },
        ("stop", None) => Some(MotionCommand::StopAxis(axis)),
        ("home", None) => Some(MotionCommand::HomeAxis(axis)),
        _ => None,
    }
}

pub struct MotionDevice {
    base: DriverBase,
    provider: Arc<dyn TransportProvider>,
    controller: Option<Box<dyn MotionController>>,
    enabled_axes: Vec<u8>,
    positions: HashMap<u8, f64>,
    /// 1 = idle, 0 = moving; absent until first observed
    axis_status: HashMap<u8, u64>,
    inputs: HashMap<u8, bool>,
    /// Next status sweep; `None` means sweep immediately
    deadline: Option<Instant>,
}

impl MotionDevice {
    pub fn new(
        config: Arc<DeviceConfig>,
        provider: Arc<dyn TransportProvider>,
        events: EventSender,
    ) -> Self {
        let enabled_axes = config.enabled_axes();
        Self {
            base: DriverBase::new(config, events),
            provider,
            controller: None,
            enabled_axes,
            positions: HashMap::new(),
            axis_status: HashMap::new(),
            inputs: HashMap::new(),
            deadline: None,
        }
    }

    fn device_label(&self) -> &str {
        &self.base.config.device_id
    }

    async fn execute(&mut self, command: MotionCommand) {
        let device = self.base.config.device_id.clone();
        let Some(controller) = self.controller.as_mut() else {
            return;
        };
        match command {
            MotionCommand::MoveAbsolute { axis, position, speed } => {
                if !self.enabled_axes.contains(&axis) {
                    warn!(%device, axis, "move on disabled axis ignored");
                    return;
                }
                if let Err(e) = controller.set_speed(axis, speed).await {
                    warn!(%device, axis, "set speed failed: {e}");
                    return;
                }
                match controller.move_absolute(axis, position).await {
                    Ok(()) => info!(%device, axis, position, speed, "absolute move started"),
                    Err(e) => warn!(%device, axis, "absolute move failed: {e}"),
                }
            },
            MotionCommand::MoveRelative { axis, distance, speed } => {
                if !self.enabled_axes.contains(&axis) {
                    warn!(%device, axis, "move on disabled axis ignored");
                    return;
                }
                if let Err(e) = controller.set_speed(axis, speed).await {
                    warn!(%device, axis, "set speed failed: {e}");
                    return;
                }
                match controller.move_relative(axis, distance).await {
                    Ok(()) => info!(%device, axis, distance, speed, "relative move started"),
                    Err(e) => warn!(%device, axis, "relative move failed: {e}"),
                }
            },
            MotionCommand::StopAxis(axis) => {
                if !self.enabled_axes.contains(&axis) {
                    return;
                }
                match controller.cancel(axis).await {
                    Ok(()) => info!(%device, axis, "axis stopped"),
                    Err(e) => warn!(%device, axis, "axis stop failed: {e}"),
                }
            },
            MotionCommand::HomeAxis(axis) => {
                // The controller interface has no homing call yet.
                warn!(%device, axis, "homing not supported, command ignored");
            },
            MotionCommand::SetOutput { output, on } => {
                match controller.set_output(output, on).await {
                    Ok(()) => {
                        publish_parameter(
                            &self.base.events,
                            &device,
                            &format!("output{output}"),
                            u64::from(on),
                        );
                        info!(%device, output, on, "output set");
                    },
                    Err(e) => warn!(%device, output, "set output failed: {e}"),
                }
            },
            MotionCommand::StopAll => {
                for axis in self.enabled_axes.clone() {
                    if let Err(e) = controller.cancel(axis).await {
                        warn!(%device, axis, "stop failed: {e}");
                    }
                }
                info!(%device, "all axes stopped");
            },
        }
    }

    /// One status sweep: axis positions and idle flags, then the input bank.
    /// Only changes are published.
    async fn sweep_status(&mut self) {
        let device = self.base.config.device_id.clone();
        let Some(controller) = self.controller.as_mut() else {
            return;
        };

        for &axis in &self.enabled_axes {
            match controller.axis_position(axis).await {
                Ok(position) => {
                    let previous = self.positions.get(&axis).copied().unwrap_or(0.0);
                    if (previous - position).abs() > POSITION_EPSILON {
                        self.positions.insert(axis, position);
                        publish_parameter(
                            &self.base.events,
                            &device,
                            &format!("axis{axis}_position"),
                            position.to_string(),
                        );
                    }
                },
                Err(e) => warn!(%device, axis, "position read failed: {e}"),
            }

            match controller.axis_idle(axis).await {
                Ok(idle) => {
                    let status = u64::from(idle);
                    if self.axis_status.get(&axis) != Some(&status) {
                        self.axis_status.insert(axis, status);
                        publish_parameter(
                            &self.base.events,
                            &device,
                            &format!("axis{axis}_status"),
                            status,
                        );
                    }
                },
                Err(e) => warn!(%device, axis, "idle read failed: {e}"),
            }
        }

        for input in 0..INPUT_COUNT {
            match controller.input(input).await {
                Ok(state) => {
                    if self.inputs.get(&input).copied().unwrap_or(false) != state {
                        self.inputs.insert(input, state);
                        publish_parameter(
                            &self.base.events,
                            &device,
                            &format!("input{input}"),
                            u64::from(state),
                        );
                    }
                },
                Err(e) => warn!(%device, input, "input read failed: {e}"),
            }
        }
    }
}

#[async_trait]
impl DeviceDriver for MotionDevice {
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
        self.controller = Some(self.provider.motion_controller(&self.base.config)?);
        Ok(())
    }

    async fn connect(&mut self) -> bool {
        let Some(controller) = self.controller.as_mut() else {
            warn!(device = %self.base.config.device_id, "connect before init_in_worker");
            return false;
        };
        if self.base.state != ConnectionState::Disconnected {
            controller.close().await;
        }
        self.base.set_state(ConnectionState::Connecting);

        match controller.open().await {
            Ok(()) => {
                self.base.set_state(ConnectionState::Connected);
                // Observed state is stale after a reconnect.
                self.positions.clear();
                self.axis_status.clear();
                self.inputs.clear();
                self.deadline = None;
                info!(
                    device = %self.base.config.device_id,
                    axes = self.enabled_axes.len(),
                    "motion controller opened"
                );
                true
            },
            Err(e) => {
                self.base.set_state(ConnectionState::Disconnected);
                warn!(device = %self.base.config.device_id, "open failed: {e}");
                false
            },
        }
    }

    async fn disconnect(&mut self) {
        if let Some(controller) = self.controller.as_mut() {
            controller.close().await;
        }
        self.base.set_state(ConnectionState::Disconnected);
    }

    async fn write_parameter(&mut self, key: &str, value_text: &str) {
        if !self.base.state.is_connected() {
            warn!(
                device = %self.device_label(),
                %key,
                "not connected, command dropped"
            );
            return;
        }
        match parse_command(key, value_text) {
            Some(command) => self.execute(command).await,
            None => debug!(device = %self.device_label(), %key, "unrecognized motion command"),
        }
    }

    async fn poll_once(&mut self) {
        if !self.base.state.is_connected() {
            future::pending::<()>().await;
            return;
        }
        if let Some(deadline) = self.deadline {
            sleep_until(deadline).await;
        }
        self.sweep_status().await;
        self.deadline = Some(
            Instant::now() + Duration::from_millis(self.base.config.status_interval_ms),
        );
    }

    async fn stop(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            controller.close().await;
        }
        self.deadline = None;
        self.base.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::AxisConfig;
    use crate::core::events::{event_channel, GatewayEvent, ParamValue};
    use crate::core::transport::{
        RawLink, RegisterTransport, TransportError, TransportResult,
    };

    #[test]
    fn test_parse_move_commands() {
        assert_eq!(
            parse_command("axis0_move_abs", "12.5,20"),
            Some(MotionCommand::MoveAbsolute { axis: 0, position: 12.5, speed: 20.0 })
        );
        assert_eq!(
            parse_command("axis3_move_rel", "-4"),
            Some(MotionCommand::MoveRelative { axis: 3, distance: -4.0, speed: 10.0 })
        );
    }

    #[test]
    fn test_parse_axis_and_io_commands() {
        assert_eq!(parse_command("axis1_stop", ""), Some(MotionCommand::StopAxis(1)));
        assert_eq!(parse_command("axis2_home", ""), Some(MotionCommand::HomeAxis(2)));
        assert_eq!(parse_command("stop_all", ""), Some(MotionCommand::StopAll));
        assert_eq!(
            parse_command("output5", "ON"),
            Some(MotionCommand::SetOutput { output: 5, on: true })
        );
        assert_eq!(
            parse_command("output5", "0"),
            Some(MotionCommand::SetOutput { output: 5, on: false })
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(parse_command("axis_move_abs", "1"), None);
        assert_eq!(parse_command("axis0_move", "1"), None);
        assert_eq!(parse_command("axis0_move_sideways", "1"), None);
        assert_eq!(parse_command("axis0_move_abs", "notanumber"), None);
        assert_eq!(parse_command("temperature", "21"), None);
        assert_eq!(parse_command("outputx", "1"), None);
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetSpeed(u8, f64),
        MoveAbs(u8, f64),
        MoveRel(u8, f64),
        Cancel(u8),
        SetOutput(u8, bool),
    }

    /// Controller double: records calls, serves scripted positions.
    struct ScriptedController {
        calls: Arc<Mutex<Vec<Call>>>,
        positions: Arc<Mutex<HashMap<u8, f64>>>,
        inputs: Arc<Mutex<HashMap<u8, bool>>>,
    }

    #[async_trait]
    impl MotionController for ScriptedController {
        async fn open(&mut self) -> TransportResult<()> {
            Ok(())
        }

        async fn close(&mut self) {}

        async fn set_speed(&mut self, axis: u8, speed: f64) -> TransportResult<()> {
            self.calls.lock().unwrap().push(Call::SetSpeed(axis, speed));
            Ok(())
        }

        async fn move_absolute(&mut self, axis: u8, position: f64) -> TransportResult<()> {
            self.calls.lock().unwrap().push(Call::MoveAbs(axis, position));
            Ok(())
        }

        async fn move_relative(&mut self, axis: u8, distance: f64) -> TransportResult<()> {
            self.calls.lock().unwrap().push(Call::MoveRel(axis, distance));
            Ok(())
        }

        async fn cancel(&mut self, axis: u8) -> TransportResult<()> {
            self.calls.lock().unwrap().push(Call::Cancel(axis));
            Ok(())
        }

        async fn set_output(&mut self, output: u8, on: bool) -> TransportResult<()> {
            self.calls.lock().unwrap().push(Call::SetOutput(output, on));
            Ok(())
        }

        async fn input(&mut self, input: u8) -> TransportResult<bool> {
            Ok(self.inputs.lock().unwrap().get(&input).copied().unwrap_or(false))
        }

        async fn axis_position(&mut self, axis: u8) -> TransportResult<f64> {
            Ok(self.positions.lock().unwrap().get(&axis).copied().unwrap_or(0.0))
        }

        async fn axis_idle(&mut self, _axis: u8) -> TransportResult<bool> {
            Ok(true)
        }
    }

    struct ScriptedProvider {
        calls: Arc<Mutex<Vec<Call>>>,
        positions: Arc<Mutex<HashMap<u8, f64>>>,
        inputs: Arc<Mutex<HashMap<u8, bool>>>,
    }

    impl TransportProvider for ScriptedProvider {
        fn register_transport(
            &self,
            _config: &DeviceConfig,
        ) -> TransportResult<Box<dyn RegisterTransport>> {
            Err(TransportError::ConnectionFailed("not modbus".into()))
        }

        fn raw_link(&self, _config: &DeviceConfig) -> TransportResult<Box<dyn RawLink>> {
            Err(TransportError::ConnectionFailed("not raw".into()))
        }

        fn motion_controller(
            &self,
            _config: &DeviceConfig,
        ) -> TransportResult<Box<dyn MotionController>> {
            Ok(Box::new(ScriptedController {
                calls: self.calls.clone(),
                positions: self.positions.clone(),
                inputs: self.inputs.clone(),
            }))
        }
    }

    fn device_config() -> Arc<DeviceConfig> {
        Arc::new(DeviceConfig {
            device_id: "zm01".into(),
            device_name: "Motion Card".into(),
            protocol: Protocol::Motion,
            server_address: 1,
            modbus_offset: 0,
            frame_interval_ms: None,
            registers: Vec::new(),
            tcp: None,
            rtu: None,
            protocol_params: Default::default(),
            axes: vec![
                AxisConfig { id: 0, enabled: true },
                AxisConfig { id: 1, enabled: false },
                AxisConfig { id: 2, enabled: true },
            ],
            status_interval_ms: 500,
        })
    }

    struct Fixture {
        device: MotionDevice,
        calls: Arc<Mutex<Vec<Call>>>,
        positions: Arc<Mutex<HashMap<u8, f64>>>,
        inputs: Arc<Mutex<HashMap<u8, bool>>>,
        rx: crate::core::events::EventReceiver,
    }

    async fn connected_fixture() -> Fixture {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let positions = Arc::new(Mutex::new(HashMap::new()));
        let inputs = Arc::new(Mutex::new(HashMap::new()));
        let provider = Arc::new(ScriptedProvider {
            calls: calls.clone(),
            positions: positions.clone(),
            inputs: inputs.clone(),
        });
        let (tx, rx) = event_channel();
        let mut device = MotionDevice::new(device_config(), provider, tx);
        device.init_in_worker().await.unwrap();
        assert!(device.connect().await);
        Fixture { device, calls, positions, inputs, rx }
    }

    fn drain_params(rx: &mut crate::core::events::EventReceiver) -> Vec<(String, ParamValue)> {
        let mut params = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let GatewayEvent::ParameterChanged { key, value, .. } = event {
                params.push((key, value));
            }
        }
        params
    }

    #[tokio::test]
    async fn test_move_command_sets_speed_then_moves() {
        let mut fx = connected_fixture().await;
        fx.device.write_parameter("axis0_move_abs", "100.0,25").await;
        fx.device.write_parameter("axis2_move_rel", "-5").await;

        assert_eq!(
            fx.calls.lock().unwrap().as_slice(),
            [
                Call::SetSpeed(0, 25.0),
                Call::MoveAbs(0, 100.0),
                Call::SetSpeed(2, 10.0),
                Call::MoveRel(2, -5.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_disabled_axis_rejected_and_stop_all_hits_enabled_only() {
        let mut fx = connected_fixture().await;
        fx.device.write_parameter("axis1_move_abs", "1").await;
        fx.device.write_parameter("stop_all", "").await;

        assert_eq!(
            fx.calls.lock().unwrap().as_slice(),
            [Call::Cancel(0), Call::Cancel(2)]
        );
    }

    #[tokio::test]
    async fn test_status_sweep_publishes_changes_only() {
        let mut fx = connected_fixture().await;
        fx.positions.lock().unwrap().insert(0, 3.25);
        fx.inputs.lock().unwrap().insert(7, true);

        fx.device.poll_once().await;
        let first = drain_params(&mut fx.rx);
        assert!(first.contains(&("axis0_position".into(), ParamValue::Text("3.25".into()))));
        assert!(first.contains(&("axis0_status".into(), ParamValue::Unsigned(1))));
        assert!(first.contains(&("input7".into(), ParamValue::Unsigned(1))));

        // Axis 2 sits at 0.0: within epsilon of the assumed start, no event.
        assert!(!first.iter().any(|(k, _)| k == "axis2_position"));

        // Unchanged state publishes nothing on the next sweep.
        fx.device.deadline = None;
        fx.device.poll_once().await;
        assert!(drain_params(&mut fx.rx).is_empty());
    }

    #[tokio::test]
    async fn test_sub_epsilon_position_change_suppressed() {
        let mut fx = connected_fixture().await;
        fx.positions.lock().unwrap().insert(0, 5.0);
        fx.device.poll_once().await;
        drain_params(&mut fx.rx);

        fx.positions.lock().unwrap().insert(0, 5.0005);
        fx.device.deadline = None;
        fx.device.poll_once().await;
        assert!(drain_params(&mut fx.rx).is_empty());
    }

    #[tokio::test]
    async fn test_commands_dropped_while_disconnected() {
        let mut fx = connected_fixture().await;
        fx.device.disconnect().await;
        fx.device.write_parameter("axis0_move_abs", "1").await;
        assert!(fx.calls.lock().unwrap().is_empty());
    }
}
