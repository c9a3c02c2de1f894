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

//! The engine-neutral read contract. Both engines expose immutable node
//! states; readers never observe partial commits through them.

#![allow(missing_docs)]

use std::fmt::Debug;
use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::property::PropertyState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    DocumentNotFound(String),
    #[error("segment {0} not found")]
    SegmentNotFound(String),
    #[error("corrupted store: {0}")]
    Corruption(String),
    #[error("store I/O error")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// An immutable snapshot of a node. Implementations are cheap to clone
/// behind an `Arc` and safe to share across threads.
pub trait NodeState: Send + Sync + Debug {
    /// For engine-specific downcasts (record-id fast paths and the like).
    fn as_any(&self) -> &dyn std::any::Any;

    /// Whether the node exists in its snapshot. Reads on a non-existent
    /// node return no properties and no children.
    fn exists(&self) -> bool;

    fn property(&self, name: &str) -> StoreResult<Option<PropertyState>>;

    /// All properties, sorted by name.
    fn properties(&self) -> StoreResult<Vec<PropertyState>>;

    fn has_child(&self, name: &str) -> StoreResult<bool> {
        Ok(self.child(name)?.exists())
    }

    /// The named child; a missing node if there is none.
    fn child(&self, name: &str) -> StoreResult<Arc<dyn NodeState>>;

    /// Names of existing children, sorted.
    fn child_names(&self) -> StoreResult<Vec<String>>;
}

/// Visitor invoked by [`compare_node_states`]. Each callback returns whether
/// the comparison should continue; `false` aborts the walk.
pub trait NodeStateDiff {
    fn property_added(&mut self, after: &PropertyState) -> StoreResult<bool> {
        let _ = after;
        Ok(true)
    }

    fn property_changed(
        &mut self,
        before: &PropertyState,
        after: &PropertyState,
    ) -> StoreResult<bool> {
        let _ = (before, after);
        Ok(true)
    }

    fn property_deleted(&mut self, before: &PropertyState) -> StoreResult<bool> {
        let _ = before;
        Ok(true)
    }

    fn child_node_added(&mut self, name: &str, after: &dyn NodeState) -> StoreResult<bool> {
        let _ = (name, after);
        Ok(true)
    }

    fn child_node_changed(
        &mut self,
        name: &str,
        before: &dyn NodeState,
        after: &dyn NodeState,
    ) -> StoreResult<bool> {
        let _ = (name, before, after);
        Ok(true)
    }

    fn child_node_deleted(&mut self, name: &str, before: &dyn NodeState) -> StoreResult<bool> {
        let _ = (name, before);
        Ok(true)
    }
}

#[derive(Debug)]
struct MissingNode;

impl NodeState for MissingNode {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn exists(&self) -> bool {
        false
    }

    fn property(&self, _name: &str) -> StoreResult<Option<PropertyState>> {
        Ok(None)
    }

    fn properties(&self) -> StoreResult<Vec<PropertyState>> {
        Ok(vec![])
    }

    fn child(&self, _name: &str) -> StoreResult<Arc<dyn NodeState>> {
        Ok(missing_node())
    }

    fn child_names(&self) -> StoreResult<Vec<String>> {
        Ok(vec![])
    }
}

static MISSING_NODE: Lazy<Arc<MissingNode>> = Lazy::new(|| Arc::new(MissingNode));

/// The shared "node does not exist" state.
pub fn missing_node() -> Arc<dyn NodeState> {
    MISSING_NODE.clone() as Arc<dyn NodeState>
}

/// Compares two node states property-by-property and child-by-child, in
/// sorted order, reporting differences to `diff`. Does not recurse into
/// changed children; that is the visitor's decision. Returns `false` if the
/// visitor aborted.
pub fn compare_node_states(
    before: &dyn NodeState,
    after: &dyn NodeState,
    diff: &mut dyn NodeStateDiff,
) -> StoreResult<bool> {
    let before_props = before.properties()?;
    let after_props = after.properties()?;
    for pair in before_props.iter().merge_join_by(after_props.iter(), |b, a| {
        b.name().cmp(a.name())
    }) {
        let proceed = match pair {
            EitherOrBoth::Left(b) => diff.property_deleted(b)?,
            EitherOrBoth::Right(a) => diff.property_added(a)?,
            EitherOrBoth::Both(b, a) => {
                if b.value() == a.value() {
                    true
                } else {
                    diff.property_changed(b, a)?
                }
            }
        };
        if !proceed {
            return Ok(false);
        }
    }

    let before_children = before.child_names()?;
    let after_children = after.child_names()?;
    for pair in before_children
        .iter()
        .merge_join_by(after_children.iter(), |b, a| b.cmp(a))
    {
        let proceed = match pair {
            EitherOrBoth::Left(name) => {
                diff.child_node_deleted(name, before.child(name)?.as_ref())?
            }
            EitherOrBoth::Right(name) => {
                diff.child_node_added(name, after.child(name)?.as_ref())?
            }
            EitherOrBoth::Both(name, _) => {
                let b = before.child(name)?;
                let a = after.child(name)?;
                if node_states_equal(b.as_ref(), a.as_ref())? {
                    true
                } else {
                    diff.child_node_changed(name, b.as_ref(), a.as_ref())?
                }
            }
        };
        if !proceed {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Deep structural equality of two node states.
pub fn node_states_equal(a: &dyn NodeState, b: &dyn NodeState) -> StoreResult<bool> {
    if a.exists() != b.exists() {
        return Ok(false);
    }
    if !a.exists() {
        return Ok(true);
    }
    if a.properties()? != b.properties()? {
        return Ok(false);
    }
    let a_children = a.child_names()?;
    if a_children != b.child_names()? {
        return Ok(false);
    }
    for name in &a_children {
        if !node_states_equal(a.child(name)?.as_ref(), b.child(name)?.as_ref())? {
            return Ok(false);
        }
    }
    Ok(true)
}
