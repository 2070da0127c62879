//! Instance identity keys.
//!
//! Every node of the reconstructed graph is addressed by the pair
//! `(type_tag, id)`, flattened to the string `"type_tag:id"`. The same key
//! format indexes the instance index and the reverse-reference map.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one instance: `"type_tag:id"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(String);

impl InstanceKey {
    /// Build a key from a type tag and an integer id.
    #[must_use]
    pub fn new(type_tag: &str, id: i64) -> Self {
        Self(format!("{type_tag}:{id}"))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<InstanceKey> for String {
    fn from(key: InstanceKey) -> Self {
        key.0
    }
}
