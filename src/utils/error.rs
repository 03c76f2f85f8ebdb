//! Error handling for the gateway service
//!
//! A single service-wide error enum plus conversions from the layered
//! component errors (codec, transport). Drivers never let an error escape
//! their worker context; everything that crosses the core boundary is either
//! a boolean result, a log line, or one of these variants.

use thiserror::Error;

use crate::core::codec::CodecError;
use crate::core::transport::TransportError;

/// Gateway service error type
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration-related errors (empty/duplicate device id, bad register
    /// table, unreadable config file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised by a transport collaborator (connect failure, protocol
    /// exception, timeout)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Write or decode targeting an address or key absent from the register map
    #[error("Mapping error: {0}")]
    Mapping(String),

    /// Bit-field would overflow its register, or a value exceeds its field width
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Operation not supported by this driver variant
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Configuration error with context
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Mapping error with context
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }
}

/// Result type used throughout the gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
