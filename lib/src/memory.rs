// Copyright 2024 The Canopy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transient in-memory node layer: a [`NodeBuilder`] records mutations as an
//! overlay over a base [`NodeState`]; [`NodeBuilder::state`] snapshots the
//! overlay into an immutable [`MemoryNodeState`] that engines consume on
//! commit. Untouched subtrees stay backed by the base state and are never
//! materialized.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::node::{missing_node, NodeState, StoreResult};
use crate::property::{PropertyState, PropertyValue};

#[derive(Debug)]
enum ChildChange {
    Removed,
    Set {
        builder: NodeBuilder,
        /// An attached subtree (from a move) keeps its captured base across
        /// rebases instead of following the new head.
        attached: bool,
    },
}

/// Records mutations over a base node state. Builders form a tree mirroring
/// only the touched part of the node tree.
pub struct NodeBuilder {
    base: Arc<dyn NodeState>,
    created: bool,
    properties: BTreeMap<String, Option<PropertyValue>>,
    children: BTreeMap<String, ChildChange>,
}

impl Debug for NodeBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuilder")
            .field("created", &self.created)
            .field("properties", &self.properties)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl NodeBuilder {
    pub fn new(base: Arc<dyn NodeState>) -> Self {
        NodeBuilder {
            base,
            created: false,
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    /// A builder for a node that does not exist yet.
    pub fn new_node() -> Self {
        NodeBuilder {
            base: missing_node(),
            created: true,
            properties: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> &Arc<dyn NodeState> {
        &self.base
    }

    pub fn exists(&self) -> bool {
        self.created || self.base.exists()
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: PropertyValue) {
        self.created = true;
        self.properties.insert(name.into(), Some(value));
    }

    pub fn remove_property(&mut self, name: &str) {
        self.properties.insert(name.to_string(), None);
    }

    pub fn property(&self, name: &str) -> StoreResult<Option<PropertyState>> {
        match self.properties.get(name) {
            Some(Some(value)) => Ok(Some(PropertyState::new(name, value.clone()))),
            Some(None) => Ok(None),
            None => self.base.property(name),
        }
    }

    /// Navigates to the child builder without changing its existence.
    pub fn child(&mut self, name: &str) -> StoreResult<&mut NodeBuilder> {
        if !self.children.contains_key(name) {
            let base_child = self.base.child(name)?;
            self.children.insert(
                name.to_string(),
                ChildChange::Set {
                    builder: NodeBuilder::new(base_child),
                    attached: false,
                },
            );
        }
        match self.children.get_mut(name).unwrap() {
            ChildChange::Set { builder, .. } => Ok(builder),
            removed @ ChildChange::Removed => {
                *removed = ChildChange::Set {
                    builder: NodeBuilder::new(missing_node()),
                    attached: false,
                };
                match removed {
                    ChildChange::Set { builder, .. } => Ok(builder),
                    ChildChange::Removed => unreachable!(),
                }
            }
        }
    }

    /// Creates the named child (if necessary) and returns its builder.
    pub fn add_child(&mut self, name: &str) -> StoreResult<&mut NodeBuilder> {
        self.created = true;
        let child = self.child(name)?;
        child.created = true;
        Ok(child)
    }

    pub fn remove_child(&mut self, name: &str) {
        self.children.insert(name.to_string(), ChildChange::Removed);
    }

    pub fn has_child(&self, name: &str) -> StoreResult<bool> {
        match self.children.get(name) {
            Some(ChildChange::Removed) => Ok(false),
            Some(ChildChange::Set { builder, .. }) => Ok(builder.exists()),
            None => self.base.has_child(name),
        }
    }

    /// Detaches the named child, returning its builder (pending changes
    /// included) for re-attachment elsewhere. Returns `None` if there is no
    /// such child.
    pub fn take_child(&mut self, name: &str) -> StoreResult<Option<NodeBuilder>> {
        match self.children.remove(name) {
            Some(ChildChange::Removed) => {
                self.children.insert(name.to_string(), ChildChange::Removed);
                Ok(None)
            }
            Some(ChildChange::Set { builder, .. }) => {
                if !builder.exists() {
                    return Ok(None);
                }
                self.children.insert(name.to_string(), ChildChange::Removed);
                Ok(Some(builder))
            }
            None => {
                let base_child = self.base.child(name)?;
                if !base_child.exists() {
                    return Ok(None);
                }
                self.children.insert(name.to_string(), ChildChange::Removed);
                Ok(Some(NodeBuilder::new(base_child)))
            }
        }
    }

    /// Attaches a detached subtree under the given name.
    pub fn put_child(&mut self, name: impl Into<String>, mut builder: NodeBuilder) {
        self.created = true;
        builder.created = true;
        self.children.insert(
            name.into(),
            ChildChange::Set {
                builder,
                attached: true,
            },
        );
    }

    pub fn has_changes(&self) -> bool {
        if self.created && !self.base.exists() {
            return true;
        }
        if self.properties.iter().any(|(_, v)| v.is_some()) {
            return true;
        }
        if !self.properties.is_empty() {
            // Only removals; they are changes unless the base lacks them too,
            // which is not worth distinguishing here.
            return true;
        }
        self.children.iter().any(|(_, change)| match change {
            ChildChange::Removed => true,
            ChildChange::Set { builder, attached } => *attached || builder.has_changes(),
        })
    }

    /// Swaps the base for a newer head. Pending changes are preserved;
    /// attached (moved) subtrees keep their captured source state.
    pub fn rebase(&mut self, new_base: Arc<dyn NodeState>) -> StoreResult<()> {
        for (name, change) in &mut self.children {
            if let ChildChange::Set { builder, attached } = change {
                if !*attached {
                    builder.rebase(new_base.child(name)?)?;
                }
            }
        }
        self.base = new_base;
        Ok(())
    }

    /// Snapshots the current overlay into an immutable state.
    pub fn state(&self) -> Arc<MemoryNodeState> {
        self.snapshot(false)
    }

    fn snapshot(&self, attached: bool) -> Arc<MemoryNodeState> {
        let children = self
            .children
            .iter()
            .map(|(name, change)| {
                let snapshot = match change {
                    ChildChange::Removed => None,
                    ChildChange::Set { builder, attached } => {
                        if builder.exists() {
                            Some(builder.snapshot(*attached))
                        } else {
                            None
                        }
                    }
                };
                (name.clone(), snapshot)
            })
            .collect();
        Arc::new(MemoryNodeState {
            base: self.base.clone(),
            created: self.created,
            attached,
            properties: self.properties.clone(),
            children,
        })
    }
}

/// An immutable snapshot of a [`NodeBuilder`]: recorded changes over a base
/// state. Unchanged subtrees delegate to the base.
pub struct MemoryNodeState {
    base: Arc<dyn NodeState>,
    created: bool,
    /// An attached (moved) subtree keeps its captured base across rebases.
    attached: bool,
    properties: BTreeMap<String, Option<PropertyValue>>,
    children: BTreeMap<String, Option<Arc<MemoryNodeState>>>,
}

impl Debug for MemoryNodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNodeState")
            .field("created", &self.created)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

impl MemoryNodeState {
    pub fn base(&self) -> &Arc<dyn NodeState> {
        &self.base
    }

    /// Whether this snapshot records no changes over its base.
    pub fn is_unchanged(&self) -> bool {
        self.properties.is_empty()
            && self.children.is_empty()
            && (self.base.exists() || !self.created)
    }

    /// The same recorded changes over a newer base. Attached (moved)
    /// subtrees keep their captured base.
    pub fn rebased(&self, new_base: Arc<dyn NodeState>) -> StoreResult<Arc<MemoryNodeState>> {
        if self.attached {
            return Ok(Arc::new(MemoryNodeState {
                base: self.base.clone(),
                created: self.created,
                attached: true,
                properties: self.properties.clone(),
                children: self.children.clone(),
            }));
        }
        let mut children = BTreeMap::new();
        for (name, child) in &self.children {
            let rebased_child = match child {
                Some(child) => Some(child.rebased(new_base.child(name)?)?),
                None => None,
            };
            children.insert(name.clone(), rebased_child);
        }
        Ok(Arc::new(MemoryNodeState {
            base: new_base,
            created: self.created,
            attached: false,
            properties: self.properties.clone(),
            children,
        }))
    }

    /// Recorded property overrides; `None` marks a removal.
    pub fn property_changes(&self) -> impl Iterator<Item = (&str, Option<&PropertyValue>)> {
        self.properties
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    /// Recorded child overrides; `None` marks a removal.
    pub fn child_changes(
        &self,
    ) -> impl Iterator<Item = (&str, Option<&Arc<MemoryNodeState>>)> {
        self.children
            .iter()
            .map(|(name, child)| (name.as_str(), child.as_ref()))
    }
}

impl NodeState for MemoryNodeState {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn exists(&self) -> bool {
        self.created || self.base.exists()
    }

    fn property(&self, name: &str) -> StoreResult<Option<PropertyState>> {
        if !self.exists() {
            return Ok(None);
        }
        match self.properties.get(name) {
            Some(Some(value)) => Ok(Some(PropertyState::new(name, value.clone()))),
            Some(None) => Ok(None),
            None => self.base.property(name),
        }
    }

    fn properties(&self) -> StoreResult<Vec<PropertyState>> {
        if !self.exists() {
            return Ok(vec![]);
        }
        let mut merged: BTreeMap<String, PropertyValue> = self
            .base
            .properties()?
            .into_iter()
            .map(|p| (p.name().to_string(), p.value().clone()))
            .collect();
        for (name, value) in &self.properties {
            match value {
                Some(value) => {
                    merged.insert(name.clone(), value.clone());
                }
                None => {
                    merged.remove(name);
                }
            }
        }
        Ok(merged
            .into_iter()
            .map(|(name, value)| PropertyState::new(name, value))
            .collect())
    }

    fn child(&self, name: &str) -> StoreResult<Arc<dyn NodeState>> {
        if !self.exists() {
            return Ok(missing_node());
        }
        match self.children.get(name) {
            Some(Some(child)) => Ok(child.clone() as Arc<dyn NodeState>),
            Some(None) => Ok(missing_node()),
            None => self.base.child(name),
        }
    }

    fn child_names(&self) -> StoreResult<Vec<String>> {
        if !self.exists() {
            return Ok(vec![]);
        }
        let mut names: BTreeSet<String> = self.base.child_names()?.into_iter().collect();
        for (name, child) in &self.children {
            match child {
                Some(_) => {
                    names.insert(name.clone());
                }
                None => {
                    names.remove(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::node::{compare_node_states, node_states_equal, NodeStateDiff};

    fn build_base() -> Arc<MemoryNodeState> {
        let mut builder = NodeBuilder::new_node();
        builder.set_property("a", PropertyValue::Long(1));
        builder
            .add_child("x")
            .unwrap()
            .set_property("p", PropertyValue::String("v".to_string()));
        builder.add_child("y").unwrap();
        builder.state()
    }

    #[test]
    fn overlay_reads_through_to_base() {
        let base = build_base();
        let builder = NodeBuilder::new(base.clone());
        let state = builder.state();
        assert!(state.exists());
        assert_eq!(
            state.property("a").unwrap(),
            Some(PropertyState::long("a", 1))
        );
        assert_eq!(state.child_names().unwrap(), vec!["x", "y"]);
        assert!(node_states_equal(state.as_ref(), base.as_ref()).unwrap());
    }

    #[test]
    fn property_and_child_mutations() {
        let base = build_base();
        let mut builder = NodeBuilder::new(base);
        builder.set_property("a", PropertyValue::Long(2));
        builder.remove_property("missing");
        builder.remove_child("y");
        builder.add_child("z").unwrap();
        let state = builder.state();
        assert_eq!(
            state.property("a").unwrap(),
            Some(PropertyState::long("a", 2))
        );
        assert_eq!(state.child_names().unwrap(), vec!["x", "z"]);
        assert!(!state.child("y").unwrap().exists());
        assert!(state.child("z").unwrap().exists());
    }

    #[test]
    fn take_and_put_child_preserves_subtree() {
        let base = build_base();
        let mut builder = NodeBuilder::new(base);
        let taken = builder.take_child("x").unwrap().unwrap();
        builder.put_child("moved", taken);
        let state = builder.state();
        assert_eq!(state.child_names().unwrap(), vec!["moved", "y"]);
        assert_eq!(
            state.child("moved").unwrap().property("p").unwrap(),
            Some(PropertyState::string("p", "v"))
        );
        assert!(!state.child("x").unwrap().exists());
    }

    #[test]
    fn take_child_of_missing_returns_none() {
        let base = build_base();
        let mut builder = NodeBuilder::new(base);
        assert!(builder.take_child("nope").unwrap().is_none());
        builder.remove_child("x");
        assert!(builder.take_child("x").unwrap().is_none());
    }

    #[test]
    fn has_changes_tracks_mutations() {
        let base = build_base();
        let mut builder = NodeBuilder::new(base);
        assert!(!builder.has_changes());
        builder.child("x").unwrap();
        assert!(!builder.has_changes());
        builder
            .child("x")
            .unwrap()
            .set_property("q", PropertyValue::Boolean(true));
        assert!(builder.has_changes());
    }

    #[test]
    fn rebase_keeps_pending_changes() {
        let base = build_base();
        let mut builder = NodeBuilder::new(base);
        builder.set_property("b", PropertyValue::Long(9));

        let mut other = NodeBuilder::new_node();
        other.set_property("c", PropertyValue::Long(3));
        let new_base = other.state();

        builder.rebase(new_base).unwrap();
        let state = builder.state();
        assert_eq!(
            state.property("b").unwrap(),
            Some(PropertyState::long("b", 9))
        );
        assert_eq!(
            state.property("c").unwrap(),
            Some(PropertyState::long("c", 3))
        );
        // The old base's property is gone with the old base.
        assert_eq!(state.property("a").unwrap(), None);
    }

    #[derive(Default)]
    struct CountingDiff {
        added: Vec<String>,
        changed: Vec<String>,
        deleted: Vec<String>,
    }

    impl NodeStateDiff for CountingDiff {
        fn property_added(&mut self, after: &PropertyState) -> StoreResult<bool> {
            self.added.push(after.name().to_string());
            Ok(true)
        }

        fn property_changed(
            &mut self,
            before: &PropertyState,
            _after: &PropertyState,
        ) -> StoreResult<bool> {
            self.changed.push(before.name().to_string());
            Ok(true)
        }

        fn property_deleted(&mut self, before: &PropertyState) -> StoreResult<bool> {
            self.deleted.push(before.name().to_string());
            Ok(true)
        }

        fn child_node_added(&mut self, name: &str, _after: &dyn NodeState) -> StoreResult<bool> {
            self.added.push(format!("child:{name}"));
            Ok(true)
        }

        fn child_node_deleted(
            &mut self,
            name: &str,
            _before: &dyn NodeState,
        ) -> StoreResult<bool> {
            self.deleted.push(format!("child:{name}"));
            Ok(true)
        }
    }

    #[test]
    fn compare_reports_overlay_changes() {
        let base = build_base();
        let mut builder = NodeBuilder::new(base.clone());
        builder.set_property("a", PropertyValue::Long(2));
        builder.set_property("n", PropertyValue::Boolean(false));
        builder.remove_child("y");
        builder.add_child("z").unwrap();
        let state = builder.state();

        let mut diff = CountingDiff::default();
        assert!(compare_node_states(base.as_ref(), state.as_ref(), &mut diff).unwrap());
        assert_eq!(diff.added, vec!["n", "child:z"]);
        assert_eq!(diff.changed, vec!["a"]);
        assert_eq!(diff.deleted, vec!["child:y"]);
    }
}
