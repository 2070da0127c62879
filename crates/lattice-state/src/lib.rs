//! # lattice-state
//!
//! The state builder: turns the server's flat instance payloads back into a
//! nested object graph and keeps reference-equality renderers honest.
//!
//! - [`StateBuilder`]: instance index, reverse-reference map, anchor
//!   sequence, and the upward-invalidation pass that gives every ancestor of
//!   a changed node a fresh reference
//! - [`ChannelState`]: the derived view over the current anchor(s)
//! - [`StateError`]: anchor type mismatches and failed lookups

#![deny(unsafe_code)]

pub mod builder;
pub mod errors;

pub use builder::{ChannelState, StateBuilder};
pub use errors::StateError;
