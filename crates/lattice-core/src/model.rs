//! The relation schema provided at channel construction.
//!
//! Generated channel definitions embed this as plain JSON: a mapping from
//! each type tag to its relational properties and their target type tags.
//! Any property absent from the map is a scalar and stored verbatim.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Static schema: `type_tag → property → target type_tag`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelMap(HashMap<String, HashMap<String, String>>);

impl ModelMap {
    /// An empty map (every field is a scalar).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `property` on `type_tag` as a relation targeting `target`.
    pub fn insert(&mut self, type_tag: &str, property: &str, target: &str) {
        let _ = self
            .0
            .entry(type_tag.to_owned())
            .or_default()
            .insert(property.to_owned(), target.to_owned());
    }

    /// Target type tag of a relational property, or `None` for scalars.
    #[must_use]
    pub fn relation_target(&self, type_tag: &str, property: &str) -> Option<&str> {
        self.0.get(type_tag)?.get(property).map(String::as_str)
    }

    /// Whether `property` on `type_tag` is a relational field.
    #[must_use]
    pub fn is_relation(&self, type_tag: &str, property: &str) -> bool {
        self.relation_target(type_tag, property).is_some()
    }
}

impl From<HashMap<String, HashMap<String, String>>> for ModelMap {
    fn from(map: HashMap<String, HashMap<String, String>>) -> Self {
        Self(map)
    }
}
