//! Gateway configuration records
//!
//! The core consumes parsed, validated configuration; this module defines the
//! records and a figment-based loader (YAML file plus `GATESRV_` environment
//! overrides). Structural validation beyond serde (duplicate ids, register
//! table invariants) happens where the records are consumed.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::core::register_map::RegisterKind;
use crate::utils::error::{GatewayError, Result};

/// Protocol discriminator selecting the concrete driver type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    ModbusRtu,
    ModbusTcp,
    TcpSocket,
    Motion,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModbusRtu => "modbus_rtu",
            Self::ModbusTcp => "modbus_tcp",
            Self::TcpSocket => "tcp_socket",
            Self::Motion => "motion",
        }
    }

    /// Default frame pacing for the Modbus variants: the serial bus gets a
    /// longer gap than TCP.
    pub fn default_frame_interval_ms(&self) -> u64 {
        match self {
            Self::ModbusRtu => 100,
            _ => 50,
        }
    }
}

/// One configured register/parameter entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub address: u16,
    pub key: String,
    #[serde(default)]
    pub name: String,
    /// Field width in bits: 1..=16, 32 or 64
    pub length: u16,
    /// Bit offset within the register, LSB = 0
    #[serde(default)]
    pub bitpos: u16,
    /// Free text containing "read" and/or "write"
    #[serde(default)]
    pub access: String,
    #[serde(default = "default_regtype")]
    pub regtype: RegisterKind,
    /// Command token for the raw-socket variant (key <-> wire command)
    #[serde(default)]
    pub command: Option<String>,
}

fn default_regtype() -> RegisterKind {
    RegisterKind::HoldingRegister
}

/// TCP connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpParams {
    pub host: String,
    pub port: u16,
}

/// Serial line parameters for Modbus RTU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuParams {
    pub port_name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    9600
}

/// Parameters the transport collaborator enforces on every exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolParams {
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_retry_count() -> u32 {
    3
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            retry_count: default_retry_count(),
        }
    }
}

/// One motion axis entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    pub id: u8,
    #[serde(default)]
    pub enabled: bool,
}

/// Complete configuration record for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    pub protocol: Protocol,
    /// Modbus server (unit) address
    #[serde(default = "default_server_address")]
    pub server_address: u8,
    /// Base-address shift added to every configured register address
    #[serde(default)]
    pub modbus_offset: u16,
    /// Frame pacing override; per-protocol default when absent
    #[serde(default)]
    pub frame_interval_ms: Option<u64>,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
    #[serde(default)]
    pub tcp: Option<TcpParams>,
    #[serde(default)]
    pub rtu: Option<RtuParams>,
    #[serde(default)]
    pub protocol_params: ProtocolParams,
    /// Motion axes (motion protocol only)
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
    /// Motion status polling interval
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
}

fn default_server_address() -> u8 {
    1
}

fn default_status_interval_ms() -> u64 {
    500
}

impl DeviceConfig {
    /// Effective frame interval for this device.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(
            self.frame_interval_ms
                .unwrap_or_else(|| self.protocol.default_frame_interval_ms()),
        )
    }

    /// Motion status cycle period.
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Ids of the enabled motion axes, in configuration order.
    pub fn enabled_axes(&self) -> Vec<u8> {
        self.axes.iter().filter(|a| a.enabled).map(|a| a.id).collect()
    }
}

/// Service-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Log to console instead of rotating files
    #[serde(default = "default_true")]
    pub console_log: bool,
}

fn default_service_name() -> String {
    "gatesrv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            console_log: true,
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl GatewayConfig {
    /// Load from a YAML or JSON file (by extension), with `GATESRV_`-prefixed
    /// environment variables overriding file values
    /// (`GATESRV_SERVICE__LOG_LEVEL=debug` etc.).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Figment::new().merge(Json::file_exact(path)),
            _ => Figment::new().merge(Yaml::file_exact(path)),
        };
        figment
            .merge(Env::prefixed("GATESRV_").split("__"))
            .extract()
            .map_err(|e| GatewayError::config(format!("failed to load configuration: {e}")))
    }
}
