//! # lattice-core
//!
//! Shared building blocks for the lattice client:
//!
//! - [`InstanceKey`]: the `"type_tag:id"` identity instances are indexed by
//! - [`InstancePayload`] / [`Operation`]: the flat wire shape of one instance
//! - [`Instance`] / [`Relation`]: the in-memory graph node with relations
//!   resolved to direct references
//! - [`ModelMap`]: the static schema telling relational fields apart from
//!   scalars
//! - [`BackoffSchedule`]: reconnect delay math for the transport

#![deny(unsafe_code)]

pub mod backoff;
pub mod ids;
pub mod instance;
pub mod model;

pub use backoff::BackoffSchedule;
pub use ids::InstanceKey;
pub use instance::{Instance, InstancePayload, Operation, Relation};
pub use model::ModelMap;
