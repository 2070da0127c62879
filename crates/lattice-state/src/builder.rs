//! Graph reconstruction from flat instance payloads.
//!
//! [`StateBuilder`] owns the instance index and the reverse-reference map.
//! Ingesting a payload runs the pipeline:
//!
//! 1. anchor-sequence maintenance (multi-anchor mode)
//! 2. single-anchor initialization
//! 3. the deletion path for `delete` payloads
//! 4. merge into the index as a brand-new node
//! 5. relation resolution via placeholders
//! 6. upward invalidation along the reverse-reference map
//!
//! Nodes are immutable behind `Arc`; every change installs a new `Arc` for
//! the changed node and for each ancestor on every path to an anchor, which
//! is what lets reference-equality renderers detect the change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use lattice_core::{Instance, InstanceKey, InstancePayload, ModelMap, Operation, Relation};

use crate::errors::StateError;

/// One incoming edge recorded in the reverse-reference map.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BackRef {
    referrer: InstanceKey,
    property: String,
}

/// Derived view over the current anchor(s).
///
/// Every call to [`StateBuilder::state`] produces fresh top-level
/// references; interior references are unchanged unless their subgraph
/// changed.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelState {
    /// Single-anchor mode: the anchor, or `None` before the first payload.
    Single(Option<Arc<Instance>>),
    /// Multi-anchor mode: one entry per anchor, in sequence order.
    Many(Vec<Arc<Instance>>),
}

impl ChannelState {
    /// The single anchor, if this is a single-anchor view and it is set.
    #[must_use]
    pub fn single(&self) -> Option<&Arc<Instance>> {
        match self {
            Self::Single(anchor) => anchor.as_ref(),
            Self::Many(_) => None,
        }
    }

    /// The anchor sequence, empty for single-anchor views.
    #[must_use]
    pub fn many(&self) -> &[Arc<Instance>] {
        match self {
            Self::Many(anchors) => anchors,
            Self::Single(_) => &[],
        }
    }
}

/// Reconstructs the nested object graph from flat payload batches.
pub struct StateBuilder {
    model: ModelMap,
    anchor_type: String,
    many: bool,
    index: HashMap<InstanceKey, Arc<Instance>>,
    backrefs: HashMap<InstanceKey, Vec<BackRef>>,
    /// Anchor id sequence, in display order.
    anchors: Vec<i64>,
    /// Membership index over `anchors`.
    anchor_ids: HashSet<i64>,
    /// First non-anchor type observed in multi-anchor mode; scopes the
    /// anchor-sequence rules to true anchor payloads.
    root_type: Option<String>,
}

impl StateBuilder {
    /// Create a builder for the given schema and anchor configuration.
    #[must_use]
    pub fn new(model: ModelMap, anchor_type: &str, many: bool) -> Self {
        Self {
            model,
            anchor_type: anchor_type.to_owned(),
            many,
            index: HashMap::new(),
            backrefs: HashMap::new(),
            anchors: Vec::new(),
            anchor_ids: HashSet::new(),
            root_type: None,
        }
    }

    /// Whether this builder tracks an ordered anchor sequence.
    #[must_use]
    pub fn is_many(&self) -> bool {
        self.many
    }

    /// Replace the anchor sequence (multi-anchor initialization).
    ///
    /// Duplicate ids are filtered; ids not yet in the index get a
    /// placeholder so `state` stays total over the sequence.
    pub fn set_anchors(&mut self, ids: &[i64]) {
        self.anchors.clear();
        self.anchor_ids.clear();
        for &id in ids {
            if self.anchor_ids.insert(id) {
                self.anchors.push(id);
                self.ensure_anchor_entry(id);
            }
        }
    }

    /// Insert an anchor id at the head of the sequence if not already
    /// present.
    pub fn prepend_anchor(&mut self, id: i64) {
        if self.anchor_ids.insert(id) {
            self.anchors.insert(0, id);
            self.ensure_anchor_entry(id);
        }
    }

    /// Current anchor id sequence.
    #[must_use]
    pub fn anchor_ids(&self) -> &[i64] {
        &self.anchors
    }

    /// Consume an ordered batch of payloads, applying each in order.
    pub fn update(&mut self, payloads: &[InstancePayload]) -> Result<(), StateError> {
        for payload in payloads {
            self.ingest(payload)?;
        }
        Ok(())
    }

    /// The derived view over the current anchor(s). Fresh top-level
    /// references on every call.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        if self.many {
            let anchors = self
                .anchors
                .iter()
                .filter_map(|&id| self.fresh_copy(&InstanceKey::new(&self.anchor_type, id)))
                .collect();
            ChannelState::Many(anchors)
        } else {
            let anchor = self
                .anchors
                .first()
                .and_then(|&id| self.fresh_copy(&InstanceKey::new(&self.anchor_type, id)));
            ChannelState::Single(anchor)
        }
    }

    /// Look up an indexed instance, failing if the identity is unknown.
    pub fn get_instance(&self, key: &InstanceKey) -> Result<Arc<Instance>, StateError> {
        self.index
            .get(key)
            .cloned()
            .ok_or_else(|| StateError::InstanceNotFound { key: key.clone() })
    }

    /// Non-failing peek at an indexed instance.
    #[must_use]
    pub fn instance(&self, key: &InstanceKey) -> Option<Arc<Instance>> {
        self.index.get(key).cloned()
    }

    // ─── Ingest pipeline ─────────────────────────────────────────────────

    fn ingest(&mut self, payload: &InstancePayload) -> Result<(), StateError> {
        if payload.is_control() {
            debug!(tstamp = payload.tstamp, "end-of-snapshot sentinel");
            return Ok(());
        }

        // 1. Anchor-sequence maintenance.
        if self.many {
            if self.is_anchor_payload(&payload.instance_type) {
                match payload.operation {
                    Operation::InitialState => {
                        if self.anchor_ids.insert(payload.id) {
                            self.anchors.push(payload.id);
                        }
                    }
                    Operation::Delete => {
                        if self.anchor_ids.remove(&payload.id) {
                            self.anchors.retain(|&id| id != payload.id);
                        }
                    }
                    _ => {}
                }
            } else if self.root_type.is_none() {
                self.root_type = Some(payload.instance_type.clone());
            }
        }

        // 2. Single-anchor initialization.
        if !self.many && self.anchors.is_empty() {
            if payload.instance_type != self.anchor_type {
                return Err(StateError::AnchorTypeMismatch {
                    expected: self.anchor_type.clone(),
                    received: payload.instance_type.clone(),
                });
            }
            self.anchors.push(payload.id);
            let _ = self.anchor_ids.insert(payload.id);
        }

        // 3. Deletion path.
        if payload.operation == Operation::Delete {
            self.delete(&payload.key(), &payload.instance_type, payload.id);
            return Ok(());
        }

        // 4. Merge into the index as a brand-new node. Only the identity
        // pair carries over from a prior entry; everything else comes from
        // the payload.
        let key = payload.key();
        let had_backrefs = self.backrefs.get(&key).is_some_and(|edges| !edges.is_empty());
        let mut node = Instance {
            id: payload.id,
            instance_type: payload.instance_type.clone(),
            tstamp: payload.tstamp,
            operation: payload.operation,
            loaded: true,
            scalars: serde_json::Map::new(),
            relations: HashMap::new(),
        };

        // 5. Resolve relations; anything not in the model map is a scalar.
        for (name, value) in &payload.fields {
            let target_type = self
                .model
                .relation_target(&payload.instance_type, name)
                .map(str::to_owned);
            let Some(target_type) = target_type else {
                let _ = node.scalars.insert(name.clone(), value.clone());
                continue;
            };
            match value {
                Value::Array(ids) => {
                    let mut targets = Vec::with_capacity(ids.len());
                    for element in ids {
                        if let Some(id) = element.as_i64() {
                            targets.push(self.get_or_create(&target_type, id, &key, name));
                        } else {
                            warn!(%key, property = %name, "non-integer id in relation sequence");
                        }
                    }
                    let _ = node.relations.insert(name.clone(), Relation::Many(targets));
                }
                Value::Null => {
                    let _ = node.relations.insert(name.clone(), Relation::One(None));
                }
                other => {
                    if let Some(id) = other.as_i64() {
                        let target = self.get_or_create(&target_type, id, &key, name);
                        let _ = node.relations.insert(name.clone(), Relation::One(Some(target)));
                    } else {
                        warn!(%key, property = %name, "non-integer id on relation");
                    }
                }
            }
        }

        let _ = self.index.insert(key.clone(), Arc::new(node));

        // 6. Upward invalidation if anything already pointed at this
        // identity; otherwise just make the reverse-reference slot exist so
        // future referrers can attach.
        if had_backrefs {
            self.invalidate(&key, &mut HashSet::new());
        } else {
            let _ = self.backrefs.entry(key).or_default();
        }

        Ok(())
    }

    /// Replace every ancestor of `key` with a shallow copy, along every path
    /// in the reverse-reference graph. `visited` breaks cycles and is keyed
    /// by instance keys, never by references.
    fn invalidate(&mut self, key: &InstanceKey, visited: &mut HashSet<InstanceKey>) {
        if !visited.insert(key.clone()) {
            return;
        }
        let Some(edges) = self.backrefs.get(key).cloned() else {
            return;
        };
        for edge in edges {
            let Some(current) = self.index.get(&edge.referrer) else {
                continue;
            };
            let mut fresh = (**current).clone();
            let is_sequence = matches!(
                fresh.relations.get(&edge.property),
                Some(Relation::Many(_))
            );
            if is_sequence {
                if let Some(Relation::Many(items)) = fresh.relations.get_mut(&edge.property) {
                    // Re-read every element from the index so swapped-out
                    // entries are picked up and the sequence itself is new.
                    let rebuilt = items
                        .iter()
                        .filter_map(|item| self.index.get(&item.key()).cloned())
                        .collect();
                    *items = rebuilt;
                }
            } else {
                let target = self.index.get(key).cloned();
                let _ = fresh
                    .relations
                    .insert(edge.property.clone(), Relation::One(target));
            }
            let _ = self.index.insert(edge.referrer.clone(), Arc::new(fresh));
            self.invalidate(&edge.referrer, visited);
        }
    }

    /// Fetch or create the target of a relation, recording the incoming
    /// edge. The referrer itself is being freshly rewritten by the caller,
    /// so no invalidation happens here.
    fn get_or_create(
        &mut self,
        target_type: &str,
        id: i64,
        referrer: &InstanceKey,
        property: &str,
    ) -> Arc<Instance> {
        let target_key = InstanceKey::new(target_type, id);
        let entry = self
            .index
            .entry(target_key.clone())
            .or_insert_with(|| Arc::new(Instance::placeholder(target_type, id)))
            .clone();
        let edges = self.backrefs.entry(target_key).or_default();
        let edge = BackRef {
            referrer: referrer.clone(),
            property: property.to_owned(),
        };
        if !edges.contains(&edge) {
            edges.push(edge);
        }
        entry
    }

    /// Remove `key` from the graph: clear it out of every referrer, then
    /// drop its index and reverse-reference entries. Each rewritten referrer
    /// is invalidated upward so renderers see the removal immediately.
    fn delete(&mut self, key: &InstanceKey, type_tag: &str, id: i64) {
        let edges = self.backrefs.remove(key).unwrap_or_default();
        for edge in &edges {
            let Some(current) = self.index.get(&edge.referrer) else {
                continue;
            };
            let mut fresh = (**current).clone();
            match fresh.relations.get_mut(&edge.property) {
                Some(Relation::Many(items)) => {
                    items.retain(|item| !(item.id == id && item.instance_type == type_tag));
                }
                Some(Relation::One(slot)) => {
                    *slot = None;
                }
                None => {}
            }
            let _ = self.index.insert(edge.referrer.clone(), Arc::new(fresh));
            self.invalidate(&edge.referrer, &mut HashSet::new());
        }
        if self.index.remove(key).is_none() {
            debug!(%key, "delete for unindexed identity");
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    fn is_anchor_payload(&self, type_tag: &str) -> bool {
        type_tag == self.anchor_type && Some(type_tag) != self.root_type.as_deref()
    }

    fn ensure_anchor_entry(&mut self, id: i64) {
        let key = InstanceKey::new(&self.anchor_type, id);
        let _ = self
            .index
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Instance::placeholder(&self.anchor_type, id)));
        let _ = self.backrefs.entry(key).or_default();
    }

    fn fresh_copy(&self, key: &InstanceKey) -> Option<Arc<Instance>> {
        self.index.get(key).map(|inst| Arc::new((**inst).clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> InstancePayload {
        serde_json::from_value(value).unwrap()
    }

    fn model(value: Value) -> ModelMap {
        serde_json::from_value(value).unwrap()
    }

    fn single_builder(model_json: Value, anchor: &str) -> StateBuilder {
        StateBuilder::new(model(model_json), anchor, false)
    }

    fn anchor(builder: &StateBuilder) -> Arc<Instance> {
        builder
            .get_instance(&InstanceKey::new("P", 1))
            .expect("anchor indexed")
    }

    // ── Scenario 1: single anchor, scalar-only ──

    #[test]
    fn single_anchor_scalar_only() {
        let mut builder = single_builder(json!({"P": {}}), "P");
        builder
            .update(&[payload(json!({
                "id": 1, "_instance_type": "P", "_operation": "create",
                "_tstamp": 1, "name": "A"
            }))])
            .unwrap();

        let state = builder.state();
        let root = state.single().unwrap();
        assert_eq!(root.id, 1);
        assert_eq!(root.instance_type, "P");
        assert!((root.tstamp - 1.0).abs() < f64::EPSILON);
        assert_eq!(root.scalar("name"), Some(&json!("A")));
        assert!(root.loaded);
    }

    #[test]
    fn state_is_none_before_first_payload() {
        let builder = single_builder(json!({"P": {}}), "P");
        assert!(builder.state().single().is_none());
    }

    #[test]
    fn state_returns_fresh_top_level_reference_per_call() {
        let mut builder = single_builder(json!({"P": {}}), "P");
        builder
            .update(&[payload(json!({
                "id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1
            }))])
            .unwrap();
        let a = builder.state();
        let b = builder.state();
        assert!(!Arc::ptr_eq(a.single().unwrap(), b.single().unwrap()));
        assert_eq!(a, b);
    }

    #[test]
    fn first_payload_of_wrong_type_is_anchor_mismatch() {
        let mut builder = single_builder(json!({"P": {}, "T": {}}), "P");
        let err = builder
            .update(&[payload(json!({
                "id": 5, "_instance_type": "T", "_operation": "create", "_tstamp": 1
            }))])
            .unwrap_err();
        assert!(matches!(err, StateError::AnchorTypeMismatch { .. }));
    }

    // ── Scenario 2: placeholder then materialization ──

    #[test]
    fn placeholder_then_materialization() {
        let mut builder = single_builder(json!({"P": {"tasks": "T"}, "T": {}}), "P");
        builder
            .update(&[payload(json!({
                "id": 1, "_instance_type": "P", "_operation": "create",
                "_tstamp": 1, "tasks": [10, 11]
            }))])
            .unwrap();

        let before = anchor(&builder);
        let tasks = before.related_many("tasks");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, 10);
        assert_eq!(tasks[1].id, 11);
        assert!(!tasks[0].loaded);
        assert!(!tasks[1].loaded);
        let stale_11 = tasks[1].clone();

        builder
            .update(&[payload(json!({
                "id": 10, "_instance_type": "T", "_operation": "create",
                "_tstamp": 2, "title": "X"
            }))])
            .unwrap();

        let after = anchor(&builder);
        assert!(!Arc::ptr_eq(&before, &after), "anchor must be fresh");
        let tasks = after.related_many("tasks");
        assert_eq!(tasks[0].scalar("title"), Some(&json!("X")));
        assert!(tasks[0].loaded);
        assert!(!tasks[1].loaded, "untouched sibling stays a placeholder");
        assert!(Arc::ptr_eq(&tasks[1], &stale_11));
    }

    // ── Scenario 3: upward invalidation through two levels ──

    #[test]
    fn upward_invalidation_through_two_levels() {
        let mut builder =
            single_builder(json!({"P": {"c": "C"}, "C": {"t": "T"}, "T": {}}), "P");
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "c": 2})),
                payload(json!({"id": 2, "_instance_type": "C", "_operation": "create", "_tstamp": 1, "t": 3})),
                payload(json!({"id": 3, "_instance_type": "T", "_operation": "create", "_tstamp": 1, "v": 0})),
            ])
            .unwrap();

        let p1 = anchor(&builder);
        let c1 = p1.related_one("c").unwrap().clone();
        let t1 = c1.related_one("t").unwrap().clone();

        builder
            .update(&[payload(json!({
                "id": 3, "_instance_type": "T", "_operation": "update", "_tstamp": 2, "v": 7
            }))])
            .unwrap();

        let p2 = anchor(&builder);
        assert!(!Arc::ptr_eq(&p1, &p2));
        let c2 = p2.related_one("c").unwrap();
        assert!(!Arc::ptr_eq(&c1, c2));
        let t2 = c2.related_one("t").unwrap();
        assert!(!Arc::ptr_eq(&t1, t2));
        assert_eq!(t2.scalar("v"), Some(&json!(7)));
    }

    // ── Scenario 4: shared reference after cross-link ──

    #[test]
    fn shared_reference_after_cross_link() {
        let mut builder = single_builder(
            json!({"P": {"c": "C", "tasks": "T"}, "C": {"tasks": "T"}, "T": {}}),
            "P",
        );
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "c": 1, "tasks": [1, 2, 3]})),
                payload(json!({"id": 1, "_instance_type": "C", "_operation": "create", "_tstamp": 1, "tasks": [3, 4, 5]})),
                payload(json!({"id": 3, "_instance_type": "T", "_operation": "create", "_tstamp": 1, "title": "t3"})),
            ])
            .unwrap();

        let root = anchor(&builder);
        let shared_from_root = &root.related_many("tasks")[2];
        let shared_from_child = &root.related_one("c").unwrap().related_many("tasks")[0];
        assert!(Arc::ptr_eq(shared_from_root, shared_from_child));
        assert_eq!(shared_from_root.scalar("title"), Some(&json!("t3")));
    }

    // ── Scenario 5: multi-anchor add/remove ──

    #[test]
    fn multi_anchor_add_and_remove() {
        let mut builder = StateBuilder::new(model(json!({"P": {}})), "P", true);
        builder.set_anchors(&[1, 2]);
        builder
            .update(&[payload(json!({
                "id": 3, "_instance_type": "P", "_operation": "initial_state", "_tstamp": 1
            }))])
            .unwrap();
        builder
            .update(&[payload(json!({
                "id": 2, "_instance_type": "P", "_operation": "delete", "_tstamp": 2
            }))])
            .unwrap();

        assert_eq!(builder.anchor_ids(), &[1, 3]);
        let state = builder.state();
        let anchors = state.many();
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].id, 1);
        assert_eq!(anchors[1].id, 3);
    }

    #[test]
    fn set_anchors_filters_duplicates_and_creates_placeholders() {
        let mut builder = StateBuilder::new(model(json!({"P": {}})), "P", true);
        builder.set_anchors(&[4, 4, 5]);
        assert_eq!(builder.anchor_ids(), &[4, 5]);
        let entry = builder.instance(&InstanceKey::new("P", 4)).unwrap();
        assert!(!entry.loaded);
    }

    #[test]
    fn prepend_anchor_inserts_at_head_once() {
        let mut builder = StateBuilder::new(model(json!({"P": {}})), "P", true);
        builder.set_anchors(&[1, 2]);
        builder.prepend_anchor(9);
        builder.prepend_anchor(9);
        builder.prepend_anchor(2);
        assert_eq!(builder.anchor_ids(), &[9, 1, 2]);
    }

    #[test]
    fn anchor_sequence_never_duplicates() {
        // P6: mixed initial_state / delete / prepend traffic.
        let mut builder = StateBuilder::new(model(json!({"P": {}})), "P", true);
        builder.set_anchors(&[1]);
        for _ in 0..2 {
            builder
                .update(&[payload(json!({
                    "id": 1, "_instance_type": "P", "_operation": "initial_state", "_tstamp": 1
                }))])
                .unwrap();
        }
        builder.prepend_anchor(1);
        builder
            .update(&[payload(json!({
                "id": 1, "_instance_type": "P", "_operation": "delete", "_tstamp": 2
            }))])
            .unwrap();
        builder
            .update(&[payload(json!({
                "id": 1, "_instance_type": "P", "_operation": "initial_state", "_tstamp": 3
            }))])
            .unwrap();
        assert_eq!(builder.anchor_ids(), &[1]);
    }

    #[test]
    fn nested_instances_of_other_types_do_not_touch_anchor_sequence() {
        let mut builder =
            StateBuilder::new(model(json!({"P": {"tasks": "T"}, "T": {}})), "P", true);
        builder.set_anchors(&[1]);
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "initial_state", "_tstamp": 1, "tasks": [7]})),
                payload(json!({"id": 7, "_instance_type": "T", "_operation": "initial_state", "_tstamp": 1})),
            ])
            .unwrap();
        assert_eq!(builder.anchor_ids(), &[1]);
    }

    // ── P1: identity preservation for untouched bystanders ──

    #[test]
    fn disjoint_update_preserves_bystander_identity() {
        let mut builder = single_builder(json!({"P": {"tasks": "T"}, "T": {}}), "P");
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "tasks": [10, 11]})),
                payload(json!({"id": 10, "_instance_type": "T", "_operation": "create", "_tstamp": 1, "title": "a"})),
                payload(json!({"id": 11, "_instance_type": "T", "_operation": "create", "_tstamp": 1, "title": "b"})),
            ])
            .unwrap();

        let bystander = builder.instance(&InstanceKey::new("T", 11)).unwrap();
        builder
            .update(&[payload(json!({
                "id": 10, "_instance_type": "T", "_operation": "update", "_tstamp": 2, "title": "a2"
            }))])
            .unwrap();

        let after = builder.instance(&InstanceKey::new("T", 11)).unwrap();
        assert!(Arc::ptr_eq(&bystander, &after));
    }

    // ── P2/P3: upward fresh, downward stable ──

    #[test]
    fn update_refreshes_ancestors_but_not_descendants() {
        let mut builder =
            single_builder(json!({"P": {"c": "C"}, "C": {"t": "T"}, "T": {}}), "P");
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "c": 2})),
                payload(json!({"id": 2, "_instance_type": "C", "_operation": "create", "_tstamp": 1, "t": 3, "label": "x"})),
                payload(json!({"id": 3, "_instance_type": "T", "_operation": "create", "_tstamp": 1})),
            ])
            .unwrap();

        let p_before = builder.instance(&InstanceKey::new("P", 1)).unwrap();
        let t_before = builder.instance(&InstanceKey::new("T", 3)).unwrap();

        builder
            .update(&[payload(json!({
                "id": 2, "_instance_type": "C", "_operation": "update", "_tstamp": 2, "t": 3, "label": "y"
            }))])
            .unwrap();

        let p_after = builder.instance(&InstanceKey::new("P", 1)).unwrap();
        let t_after = builder.instance(&InstanceKey::new("T", 3)).unwrap();
        assert!(!Arc::ptr_eq(&p_before, &p_after), "ancestor must be fresh");
        assert!(Arc::ptr_eq(&t_before, &t_after), "descendant keeps identity");
        assert!(Arc::ptr_eq(
            p_after.related_one("c").unwrap().related_one("t").unwrap(),
            &t_after
        ));
    }

    // ── P4: placeholder completeness ──

    #[test]
    fn every_relational_target_is_indexed() {
        let mut builder = single_builder(
            json!({"P": {"tasks": "T", "lead": "U"}, "T": {"assignee": "U"}, "U": {}}),
            "P",
        );
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "tasks": [10, 11], "lead": 100})),
                payload(json!({"id": 10, "_instance_type": "T", "_operation": "create", "_tstamp": 1, "assignee": 101})),
            ])
            .unwrap();

        for key in [
            InstanceKey::new("T", 10),
            InstanceKey::new("T", 11),
            InstanceKey::new("U", 100),
            InstanceKey::new("U", 101),
        ] {
            assert!(builder.instance(&key).is_some(), "missing {key}");
        }
    }

    // ── P5: arrival-order independence ──

    #[test]
    fn batch_permutation_yields_equal_graph() {
        let batch = vec![
            json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "c": 2, "name": "root"}),
            json!({"id": 2, "_instance_type": "C", "_operation": "create", "_tstamp": 1, "t": 3}),
            json!({"id": 3, "_instance_type": "T", "_operation": "create", "_tstamp": 1, "title": "leaf"}),
        ];
        let model_json = json!({"P": {"c": "C"}, "C": {"t": "T"}, "T": {}});

        let mut forward = single_builder(model_json.clone(), "P");
        forward
            .update(&batch.iter().cloned().map(payload).collect::<Vec<_>>())
            .unwrap();

        // Referent-before-referrer order for the nested instances; the
        // anchor still has to come first in single-anchor mode.
        let mut reversed = single_builder(model_json, "P");
        reversed
            .update(&[
                payload(batch[0].clone()),
                payload(batch[2].clone()),
                payload(batch[1].clone()),
            ])
            .unwrap();

        assert_eq!(forward.state(), reversed.state());
    }

    // ── Deletion ──

    #[test]
    fn delete_clears_single_relations_and_filters_sequences() {
        let mut builder = single_builder(
            json!({"P": {"tasks": "T", "lead": "T"}, "T": {}}),
            "P",
        );
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "tasks": [10, 11], "lead": 10})),
                payload(json!({"id": 10, "_instance_type": "T", "_operation": "create", "_tstamp": 1})),
                payload(json!({"id": 11, "_instance_type": "T", "_operation": "create", "_tstamp": 1})),
            ])
            .unwrap();

        builder
            .update(&[payload(json!({
                "id": 10, "_instance_type": "T", "_operation": "delete", "_tstamp": 2
            }))])
            .unwrap();

        let root = anchor(&builder);
        let tasks = root.related_many("tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, 11);
        assert!(matches!(root.relation("lead"), Some(Relation::One(None))));
        assert!(builder.instance(&InstanceKey::new("T", 10)).is_none());
        assert!(matches!(
            builder.get_instance(&InstanceKey::new("T", 10)),
            Err(StateError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn delete_refreshes_the_ancestor_chain() {
        let mut builder =
            single_builder(json!({"P": {"c": "C"}, "C": {"tasks": "T"}, "T": {}}), "P");
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "c": 2})),
                payload(json!({"id": 2, "_instance_type": "C", "_operation": "create", "_tstamp": 1, "tasks": [3]})),
                payload(json!({"id": 3, "_instance_type": "T", "_operation": "create", "_tstamp": 1})),
            ])
            .unwrap();

        let p_before = builder.instance(&InstanceKey::new("P", 1)).unwrap();
        builder
            .update(&[payload(json!({
                "id": 3, "_instance_type": "T", "_operation": "delete", "_tstamp": 2
            }))])
            .unwrap();

        let p_after = builder.instance(&InstanceKey::new("P", 1)).unwrap();
        assert!(!Arc::ptr_eq(&p_before, &p_after));
        assert!(p_after.related_one("c").unwrap().related_many("tasks").is_empty());
    }

    #[test]
    fn delete_for_unknown_identity_is_a_no_op() {
        let mut builder = single_builder(json!({"P": {}}), "P");
        builder
            .update(&[payload(json!({
                "id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1
            }))])
            .unwrap();
        builder
            .update(&[payload(json!({
                "id": 99, "_instance_type": "P", "_operation": "delete", "_tstamp": 2
            }))])
            .unwrap();
        assert!(builder.state().single().is_some());
    }

    // ── Misc edges ──

    #[test]
    fn null_foreign_key_resolves_to_empty_relation() {
        let mut builder = single_builder(json!({"P": {"lead": "U"}, "U": {}}), "P");
        builder
            .update(&[payload(json!({
                "id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "lead": null
            }))])
            .unwrap();
        let root = anchor(&builder);
        assert!(matches!(root.relation("lead"), Some(Relation::One(None))));
    }

    #[test]
    fn control_payload_is_skipped() {
        let mut builder = single_builder(json!({"P": {}}), "P");
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1})),
                payload(json!({"id": 0, "_instance_type": "", "_operation": "end_initial_state", "_tstamp": 5})),
            ])
            .unwrap();
        assert!(builder.state().single().is_some());
        assert!(builder.instance(&InstanceKey::new("", 0)).is_none());
    }

    #[test]
    fn reapplied_snapshot_is_idempotent_by_value() {
        let batch = vec![
            json!({"id": 1, "_instance_type": "P", "_operation": "initial_state", "_tstamp": 1, "tasks": [10]}),
            json!({"id": 10, "_instance_type": "T", "_operation": "initial_state", "_tstamp": 1, "title": "a"}),
        ];
        let mut builder = single_builder(json!({"P": {"tasks": "T"}, "T": {}}), "P");
        let payloads: Vec<_> = batch.iter().cloned().map(payload).collect();
        builder.update(&payloads).unwrap();
        let first = builder.state();
        builder.update(&payloads).unwrap();
        assert_eq!(first, builder.state());
    }

    #[test]
    fn cyclic_references_terminate() {
        let mut builder =
            single_builder(json!({"P": {"c": "C"}, "C": {"p": "P"}}), "P");
        builder
            .update(&[
                payload(json!({"id": 1, "_instance_type": "P", "_operation": "create", "_tstamp": 1, "c": 2})),
                payload(json!({"id": 2, "_instance_type": "C", "_operation": "create", "_tstamp": 1, "p": 1})),
            ])
            .unwrap();
        // Re-ingesting inside the cycle must not loop forever.
        builder
            .update(&[payload(json!({
                "id": 2, "_instance_type": "C", "_operation": "update", "_tstamp": 2, "p": 1, "note": "spin"
            }))])
            .unwrap();
        let root = anchor(&builder);
        assert_eq!(
            root.related_one("c").unwrap().scalar("note"),
            Some(&json!("spin"))
        );
    }
}
