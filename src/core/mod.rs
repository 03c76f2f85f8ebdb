//! Core gateway machinery: register model, codec, scheduling, transport
//! seams and the outbound event stream.

pub mod aggregator;
pub mod codec;
pub mod events;
pub mod register_map;
pub mod scheduler;
pub mod transport;
