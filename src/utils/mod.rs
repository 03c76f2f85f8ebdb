//! Utility modules shared across the gateway

pub mod error;
pub mod logger;

pub use error::{GatewayError, Result};
