//! Wire payloads and in-memory graph nodes.
//!
//! The server streams flat [`InstancePayload`]s; the state builder resolves
//! their relational fields into direct references and stores the result as
//! an [`Instance`] behind an `Arc`. A "fresh reference" for a node means a
//! new `Arc` allocation; a shallow copy clones the scalar map and the
//! relation pointers, never the referenced subgraphs.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::InstanceKey;

/// Operation tag carried by every instance payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// A new instance, or the first payload for a referenced identity.
    Create,
    /// A changed instance.
    Update,
    /// The instance was removed server-side.
    Delete,
    /// Part of the initial snapshot after (re)connecting.
    InitialState,
    /// End-of-snapshot sentinel; carries no instance data.
    EndInitialState,
}

/// One flat instance payload as received from the server.
///
/// Besides the four tagged fields, a payload carries arbitrary scalar and
/// relational fields; which is which is decided by the [`ModelMap`].
///
/// [`ModelMap`]: crate::model::ModelMap
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstancePayload {
    pub id: i64,
    #[serde(rename = "_instance_type")]
    pub instance_type: String,
    #[serde(rename = "_operation")]
    pub operation: Operation,
    #[serde(rename = "_tstamp")]
    pub tstamp: f64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl InstancePayload {
    /// Identity key of this payload.
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.instance_type, self.id)
    }

    /// Whether this is the end-of-snapshot sentinel rather than instance
    /// data. Sentinels carry an empty type tag.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.instance_type.is_empty() || self.operation == Operation::EndInitialState
    }
}

/// A relational field resolved in place to direct references.
#[derive(Clone, Debug, PartialEq)]
pub enum Relation {
    /// Single-target relation. `None` after the target was deleted.
    One(Option<Arc<Instance>>),
    /// Ordered multi-target relation.
    Many(Vec<Arc<Instance>>),
}

/// One node of the reconstructed graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Instance {
    pub id: i64,
    pub instance_type: String,
    pub tstamp: f64,
    pub operation: Operation,
    /// `false` while this entry is a placeholder for a referenced identity
    /// whose payload has not arrived yet.
    pub loaded: bool,
    /// Scalar fields, stored verbatim from the payload.
    pub scalars: Map<String, Value>,
    /// Relational fields, resolved to direct references.
    pub relations: HashMap<String, Relation>,
}

impl Instance {
    /// A placeholder entry for an identity that was referenced but not yet
    /// received.
    #[must_use]
    pub fn placeholder(type_tag: &str, id: i64) -> Self {
        Self {
            id,
            instance_type: type_tag.to_owned(),
            tstamp: 0.0,
            operation: Operation::Create,
            loaded: false,
            scalars: Map::new(),
            relations: HashMap::new(),
        }
    }

    /// Identity key of this instance.
    #[must_use]
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.instance_type, self.id)
    }

    /// Scalar field by name.
    #[must_use]
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        self.scalars.get(name)
    }

    /// Relational field by name.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Single-target relation by name, if present and set.
    #[must_use]
    pub fn related_one(&self, name: &str) -> Option<&Arc<Instance>> {
        match self.relations.get(name) {
            Some(Relation::One(target)) => target.as_ref(),
            _ => None,
        }
    }

    /// Multi-target relation by name, empty slice if absent.
    #[must_use]
    pub fn related_many(&self, name: &str) -> &[Arc<Instance>] {
        match self.relations.get(name) {
            Some(Relation::Many(targets)) => targets,
            _ => &[],
        }
    }
}
