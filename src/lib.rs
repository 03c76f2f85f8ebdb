//! Industrial device communication gateway
//!
//! `gatesrv` polls a fleet of heterogeneous field devices (Modbus RTU/TCP
//! register devices, a raw text-over-TCP variant and a multi-axis motion
//! card) and republishes their state as one event stream.
//!
//! The moving parts:
//! - [`core`]: bit-field register codec, register map, poll scheduler,
//!   transport collaborator traits and the outbound event stream
//! - [`drivers`]: one driver per protocol family, composed from the core
//! - [`manager`]: device registry, per-device worker tasks and the ordered
//!   shutdown protocol
//! - [`sim`]: in-process transport simulators for tests and demos
//!
//! Every device is owned by exactly one worker task; the rest of the world
//! talks to it through commands and reads its output from the event stream
//! or the [`core::aggregator::DataAggregator`].

pub mod config;
pub mod core;
pub mod drivers;
pub mod manager;
pub mod sim;
pub mod utils;

pub use self::core::aggregator::DataAggregator;
pub use self::core::events::{
    event_channel, EventReceiver, EventSender, GatewayEvent, ParamValue,
};
pub use self::core::transport::{ConnectionState, TransportProvider};
pub use config::{DeviceConfig, GatewayConfig, Protocol};
pub use manager::DeviceManager;
pub use utils::error::{GatewayError, Result};
