//! # lattice-transport
//!
//! The persistent duplex channel under a state channel:
//!
//! - [`Transport`]: owns one WebSocket, performs the token handshake, and
//!   reconnects with capped exponential backoff unless terminally closed
//! - [`ServerFrame`] / [`classify`]: shape-based demux of inbound JSON
//!   frames
//! - [`TransportEvent`]: the typed stream the coordinator consumes
//! - [`CloseReason`]: the explicit non-reconnect terminal states

#![deny(unsafe_code)]

pub mod frame;
pub mod socket;

pub use frame::{classify, ServerFrame};
pub use socket::{CloseReason, Transport, TransportConfig, TransportEvent};
