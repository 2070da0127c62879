//! # lattice-channel
//!
//! The channel coordinator: composes one [`Transport`] and one
//! [`StateBuilder`] and exposes the subscription surface a renderer binds
//! to.
//!
//! - [`StateChannel`]: lifecycle root — lazy init on the first subscriber,
//!   teardown on the last, listener fan-out, request/response RPC
//! - [`ChannelConfig`]: endpoint template, args, token, backoff bounds
//! - [`ActionError`] / [`CallIdGenerator`] / [`PendingActions`]: the RPC
//!   correlation layer
//!
//! [`Transport`]: lattice_transport::Transport
//! [`StateBuilder`]: lattice_state::StateBuilder

#![deny(unsafe_code)]

pub mod actions;
pub mod channel;
pub mod config;
pub mod listeners;

pub use actions::{ActionError, CallIdGenerator, PendingActions};
pub use channel::{InstanceSubscription, StateChannel, Subscription};
pub use config::ChannelConfig;
pub use listeners::ListenerSet;
