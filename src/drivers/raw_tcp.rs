//! Raw text-over-TCP driver
//!
//! Speaks a simple `<COMMAND,value>` framing with the device. Each
//! configured register entry carries a wire command token; writes encode the
//! token plus value, and inbound frames are mapped back to keys and
//! published as text values. Every byte crossing the wire is also surfaced
//! as a raw-frame event for presentation-layer logs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{DeviceDriver, DriverBase};
use crate::config::{DeviceConfig, Protocol};
use crate::core::events::{publish_parameter, publish_raw_frame, EventSender};
use crate::core::transport::{ConnectionState, RawLink, TransportProvider};
use crate::utils::error::Result;

/// Encode one outbound frame: `<COMMAND,value>`.
pub(crate) fn encode_request(command: &str, value: &str) -> String {
    format!("<{command},{value}>")
}

/// Split a possibly concatenated response like `<A,1><B><C,2>` into
/// (command, value) pairs. Malformed fragments are dropped.
pub(crate) fn parse_frames(data: &str) -> Vec<(String, String)> {
    let mut frames = Vec::new();
    for fragment in data.split('<').skip(1) {
        let Some(content) = fragment.strip_suffix('>').or_else(|| {
            // Trailing garbage after '>' (e.g. line endings) is tolerated.
            fragment.find('>').map(|i| &fragment[..i])
        }) else {
            continue;
        };
        let mut parts = content.splitn(2, ',');
        let Some(command) = parts.next().filter(|c| !c.is_empty()) else {
            continue;
        };
        let value = parts.next().unwrap_or("");
        frames.push((command.to_string(), value.to_string()));
    }
    frames
}

pub struct RawTcpDevice {
    base: DriverBase,
    provider: Arc<dyn TransportProvider>,
    /// key -> wire command token
    commands: HashMap<String, String>,
    /// wire command token -> key
    keys: HashMap<String, String>,
    link: Option<Box<dyn RawLink>>,
    inbound: Option<mpsc::Receiver<Bytes>>,
}

impl RawTcpDevice {
    pub fn new(
        config: Arc<DeviceConfig>,
        provider: Arc<dyn TransportProvider>,
        events: EventSender,
    ) -> Self {
        let mut commands = HashMap::new();
        let mut keys = HashMap::new();
        for reg in &config.registers {
            if let Some(command) = &reg.command {
                commands.insert(reg.key.clone(), command.clone());
                keys.insert(command.clone(), reg.key.clone());
            }
        }
        Self {
            base: DriverBase::new(config, events),
            provider,
            commands,
            keys,
            link: None,
            inbound: None,
        }
    }

    async fn send_text(&mut self, text: &str) {
        if !self.base.state.is_connected() {
            debug!(device = %self.base.config.device_id, "not connected, text dropped");
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let payload = Bytes::copy_from_slice(text.as_bytes());
        match link.send(&payload).await {
            Ok(()) => {
                publish_raw_frame(&self.base.events, &self.base.config.device_id, payload, true);
            },
            Err(e) => {
                warn!(device = %self.base.config.device_id, "send failed: {e}");
            },
        }
    }

    fn handle_inbound(&mut self, data: &Bytes) {
        publish_raw_frame(
            &self.base.events,
            &self.base.config.device_id,
            data.clone(),
            false,
        );
        let text = String::from_utf8_lossy(data);
        for (command, value) in parse_frames(&text) {
            match self.keys.get(&command) {
                Some(key) => {
                    publish_parameter(
                        &self.base.events,
                        &self.base.config.device_id,
                        key,
                        value,
                    );
                },
                None => {
                    debug!(
                        device = %self.base.config.device_id,
                        %command,
                        "response for unknown command"
                    );
                },
            }
        }
    }
}

#[async_trait]
impl DeviceDriver for RawTcpDevice {
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
        self.link = Some(self.provider.raw_link(&self.base.config)?);
        Ok(())
    }

    async fn connect(&mut self) -> bool {
        let Some(link) = self.link.as_mut() else {
            warn!(device = %self.base.config.device_id, "connect before init_in_worker");
            return false;
        };
        if self.base.state != ConnectionState::Disconnected {
            link.disconnect().await;
            self.inbound = None;
        }
        self.base.set_state(ConnectionState::Connecting);

        match link.connect().await {
            Ok(rx) => {
                self.inbound = Some(rx);
                self.base.set_state(ConnectionState::Connected);
                info!(device = %self.base.config.device_id, "raw link connected");
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
        if let Some(link) = self.link.as_mut() {
            link.disconnect().await;
        }
        self.inbound = None;
        self.base.set_state(ConnectionState::Disconnected);
    }

    async fn write_parameter(&mut self, key: &str, value_text: &str) {
        let Some(command) = self.commands.get(key).cloned() else {
            warn!(device = %self.base.config.device_id, %key, "write to unknown key");
            return;
        };
        let frame = encode_request(&command, value_text);
        self.send_text(&frame).await;
    }

    async fn write_raw(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.send_text(text).await;
    }

    async fn poll_once(&mut self) {
        let Some(inbound) = self.inbound.as_mut() else {
            future::pending::<()>().await;
            return;
        };
        match inbound.recv().await {
            Some(data) => self.handle_inbound(&data),
            None => {
                // Link task dropped its sender: the connection is gone.
                warn!(device = %self.base.config.device_id, "raw link closed");
                self.inbound = None;
                self.base.set_state(ConnectionState::Disconnected);
            },
        }
    }

    async fn stop(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.disconnect().await;
        }
        self.inbound = None;
        self.base.set_state(ConnectionState::Disconnected);
    }
}
