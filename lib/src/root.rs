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

//! A session's view of the repository: a [`Root`] buffers transient
//! mutations over a store branch, and [`MutableTree`] handles navigate it.
//! In-flight moves form a chain of move records; a tree handle remembers
//! the last record it saw and catches up lazily, so its path stays correct
//! without rebuilding the tree.

#![allow(missing_docs)]

use std::cell::RefCell;
use std::sync::Arc;

use crate::commit_hook::CommitHook;
use crate::memory::NodeBuilder;
use crate::node::{NodeState, StoreResult};
use crate::node_store::{CommitResult, NodeStore, NodeStoreBranch};
use crate::path::NodePath;
use crate::property::{PropertyState, PropertyValue};

#[derive(Debug, Clone)]
struct MoveRecord {
    source: NodePath,
    destination: NodePath,
}

/// A session-private root. Not thread-safe; a session owns its root.
pub struct Root<'s> {
    branch: RefCell<Box<dyn NodeStoreBranch + 's>>,
    builder: RefCell<NodeBuilder>,
    moves: RefCell<Vec<MoveRecord>>,
}

impl<'s> Root<'s> {
    pub fn new(store: &'s dyn NodeStore) -> StoreResult<Root<'s>> {
        let branch = store.branch()?;
        let builder = NodeBuilder::new(branch.base());
        Ok(Root {
            branch: RefCell::new(branch),
            builder: RefCell::new(builder),
            moves: RefCell::new(vec![]),
        })
    }

    /// A handle on the node at `path` (which need not exist).
    pub fn tree(&self, path: &str) -> MutableTree<'_, 's> {
        MutableTree {
            root: self,
            location: RefCell::new(Location {
                path: NodePath::from(path),
                last_move: self.moves.borrow().len(),
            }),
        }
    }

    pub fn base(&self) -> Arc<dyn NodeState> {
        self.branch.borrow().base()
    }

    pub fn has_pending_changes(&self) -> bool {
        self.builder.borrow().has_changes()
    }

    /// Moves the subtree at `source` to `destination`. Returns `false` if
    /// the source does not exist, the destination parent does not exist, or
    /// the destination is already taken.
    pub fn move_node(&self, source: &str, destination: &str) -> StoreResult<bool> {
        let source = NodePath::from(source);
        let destination = NodePath::from(destination);
        if source.is_ancestor_of(&destination) || source == destination {
            return Ok(false);
        }
        let (Some(source_parent), Some(dest_parent)) = (source.parent(), destination.parent())
        else {
            return Ok(false);
        };
        let mut builder = self.builder.borrow_mut();
        {
            let dest_parent_builder = builder_at(&mut builder, &dest_parent)?;
            if !dest_parent_builder.exists() {
                return Ok(false);
            }
            if dest_parent_builder.has_child(destination.name())? {
                return Ok(false);
            }
        }
        let taken = {
            let source_parent_builder = builder_at(&mut builder, &source_parent)?;
            source_parent_builder.take_child(source.name())?
        };
        let Some(taken) = taken else {
            return Ok(false);
        };
        let dest_parent_builder = builder_at(&mut builder, &dest_parent)?;
        dest_parent_builder.put_child(destination.name(), taken);
        drop(builder);
        self.moves.borrow_mut().push(MoveRecord {
            source,
            destination,
        });
        Ok(true)
    }

    /// Re-bases pending changes onto the store's current head.
    pub fn rebase(&self) -> StoreResult<()> {
        let mut branch = self.branch.borrow_mut();
        branch.rebase()?;
        self.builder.borrow_mut().rebase(branch.base())
    }

    /// Discards pending changes and re-reads the current head.
    pub fn refresh(&self) -> StoreResult<()> {
        let mut branch = self.branch.borrow_mut();
        branch.rebase()?;
        *self.builder.borrow_mut() = NodeBuilder::new(branch.base());
        self.moves.borrow_mut().clear();
        Ok(())
    }

    /// Publishes the pending changes through the hook pipeline. On success
    /// the root continues at the new head with no pending changes.
    pub fn commit(&self, hook: &dyn CommitHook) -> CommitResult<()> {
        let staged = self.builder.borrow().state();
        let mut branch = self.branch.borrow_mut();
        branch.set_root(staged)?;
        let merged = branch.merge(hook)?;
        *self.builder.borrow_mut() = NodeBuilder::new(merged);
        self.moves.borrow_mut().clear();
        Ok(())
    }

    /// The pending state as an immutable snapshot.
    pub fn state(&self) -> Arc<dyn NodeState> {
        self.builder.borrow().state()
    }

    /// Applies move records `from..` to `path`, returning the adjusted path
    /// and the new chain position.
    fn catch_up(&self, path: &NodePath, from: usize) -> (NodePath, usize) {
        let moves = self.moves.borrow();
        let mut path = path.clone();
        for record in moves.iter().skip(from.min(moves.len())) {
            if record.source == path {
                path = record.destination.clone();
            } else if record.source.is_ancestor_of(&path) {
                let suffix = path.as_str()[record.source.as_str().len()..].to_string();
                path = NodePath::from(format!("{}{}", record.destination.as_str(), suffix).as_str());
            }
        }
        (path, moves.len())
    }
}

fn builder_at<'b>(
    builder: &'b mut NodeBuilder,
    path: &NodePath,
) -> StoreResult<&'b mut NodeBuilder> {
    let mut current = builder;
    for component in path.components() {
        current = current.child(component)?;
    }
    Ok(current)
}

struct Location {
    path: NodePath,
    last_move: usize,
}

/// A mutable handle on one node of a [`Root`]. Cheap; does not pin any
/// state. The handle stays valid across moves of itself or its ancestors.
pub struct MutableTree<'r, 's> {
    root: &'r Root<'s>,
    location: RefCell<Location>,
}

impl<'r, 's> MutableTree<'r, 's> {
    /// The handle's current path, adjusted for any moves recorded since the
    /// last access.
    pub fn path(&self) -> NodePath {
        let mut location = self.location.borrow_mut();
        let (path, last_move) = self.root.catch_up(&location.path, location.last_move);
        location.path = path.clone();
        location.last_move = last_move;
        path
    }

    pub fn name(&self) -> String {
        self.path().name().to_string()
    }

    pub fn exists(&self) -> StoreResult<bool> {
        let path = self.path();
        let mut builder = self.root.builder.borrow_mut();
        Ok(builder_at(&mut builder, &path)?.exists())
    }

    pub fn property(&self, name: &str) -> StoreResult<Option<PropertyState>> {
        let path = self.path();
        let mut builder = self.root.builder.borrow_mut();
        let node = builder_at(&mut builder, &path)?;
        if !node.exists() {
            return Ok(None);
        }
        node.property(name)
    }

    pub fn set_property(&self, name: &str, value: PropertyValue) -> StoreResult<()> {
        let path = self.path();
        let mut builder = self.root.builder.borrow_mut();
        builder_at(&mut builder, &path)?.set_property(name, value);
        Ok(())
    }

    pub fn remove_property(&self, name: &str) -> StoreResult<()> {
        let path = self.path();
        let mut builder = self.root.builder.borrow_mut();
        builder_at(&mut builder, &path)?.remove_property(name);
        Ok(())
    }

    pub fn child(&self, name: &str) -> MutableTree<'r, 's> {
        let path = self.path().join(name);
        MutableTree {
            root: self.root,
            location: RefCell::new(Location {
                path,
                last_move: self.root.moves.borrow().len(),
            }),
        }
    }

    pub fn child_names(&self) -> StoreResult<Vec<String>> {
        let path = self.path();
        let mut builder = self.root.builder.borrow_mut();
        let node = builder_at(&mut builder, &path)?;
        if !node.exists() {
            return Ok(vec![]);
        }
        node.state().child_names()
    }

    /// Creates the named child if it does not exist yet.
    pub fn add_child(&self, name: &str) -> StoreResult<MutableTree<'r, 's>> {
        let path = self.path();
        {
            let mut builder = self.root.builder.borrow_mut();
            builder_at(&mut builder, &path)?.add_child(name)?;
        }
        Ok(self.child(name))
    }

    /// Removes this node and its subtree. Returns `false` if it did not
    /// exist.
    pub fn remove(&self) -> StoreResult<bool> {
        let path = self.path();
        let Some(parent) = path.parent() else {
            return Ok(false);
        };
        let mut builder = self.root.builder.borrow_mut();
        let parent_builder = builder_at(&mut builder, &parent)?;
        if !parent_builder.has_child(path.name())? {
            return Ok(false);
        }
        parent_builder.remove_child(path.name());
        Ok(true)
    }

    /// Moves this node under `new_parent` with the name `new_name`. The
    /// handle follows the move.
    pub fn move_to(&self, new_parent: &MutableTree<'_, '_>, new_name: &str) -> StoreResult<bool> {
        let source = self.path();
        let destination = new_parent.path().join(new_name);
        self.root.move_node(source.as_str(), destination.as_str())
    }
}
