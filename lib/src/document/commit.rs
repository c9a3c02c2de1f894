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

//! Turns a staged tree diff into per-document update operations and applies
//! them with the commit-root protocol: content first, the commit marker
//! last, with rollback of everything applied if a conflict surfaces.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use crate::document::document::{
    escape_property_name, NodeDocument, RevisionContext, COLLISIONS, COMMIT_ROOT, DELETED,
    LAST_REV, MODIFIED, REVISIONS,
};
use crate::document::store::{Collection, DocumentStore, DocumentStoreError};
use crate::document::update_op::UpdateOp;
use crate::memory::MemoryNodeState;
use crate::node::{
    compare_node_states, NodeState, NodeStateDiff, StoreResult,
};
use crate::node_store::{CommitError, CommitResult};
use crate::path::NodePath;
use crate::property::PropertyState;
use crate::revision::Revision;

/// `_modified` keeps a five-second-resolution timestamp.
pub fn modified_seconds(timestamp_ms: u64) -> i64 {
    (timestamp_ms as i64 / 1000 / 5) * 5
}

/// A batch of document mutations sharing one commit revision.
pub struct Commit {
    base_revision: Revision,
    revision: Revision,
    /// When set, this is a persisted branch commit: the marker records the
    /// branch base instead of `"c"`.
    branch_base: Option<Revision>,
    /// Revisions the conflict scan must ignore: earlier commits of the same
    /// branch.
    excluded: Vec<Revision>,
    operations: BTreeMap<NodePath, UpdateOp>,
    touched_keys: BTreeMap<NodePath, Vec<String>>,
}

/// What a successfully applied commit recorded, for branch bookkeeping.
#[derive(Debug)]
pub struct AppliedCommit {
    pub commit_root: NodePath,
    pub touched: Vec<(NodePath, Vec<String>)>,
}

impl Commit {
    pub fn new(base_revision: Revision, revision: Revision) -> Self {
        Commit {
            base_revision,
            revision: revision.as_trunk_revision(),
            branch_base: None,
            excluded: vec![],
            operations: BTreeMap::new(),
            touched_keys: BTreeMap::new(),
        }
    }

    /// Excludes revisions from the conflict scan (the branch's own earlier
    /// commits when persisting on a branch).
    pub fn exclude_revisions(&mut self, revisions: impl IntoIterator<Item = Revision>) {
        self.excluded
            .extend(revisions.into_iter().map(|r| r.as_trunk_revision()));
    }

    pub fn new_branch_commit(
        base_revision: Revision,
        revision: Revision,
        branch_base: Revision,
    ) -> Self {
        let mut commit = Commit::new(base_revision, revision);
        commit.branch_base = Some(branch_base.as_trunk_revision());
        commit
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.operations.len()
    }

    fn op_mut(&mut self, path: &NodePath, is_new: bool) -> &mut UpdateOp {
        self.operations
            .entry(path.clone())
            .or_insert_with(|| UpdateOp::new(path.document_id(), is_new))
    }

    fn touch(&mut self, path: &NodePath, key: &str) {
        let keys = self.touched_keys.entry(path.clone()).or_default();
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }

    pub fn add_node(&mut self, path: &NodePath) {
        let revision = self.revision;
        self.op_mut(path, true)
            .set_map_entry(DELETED, revision, Some("false".to_string()));
        self.touch(path, DELETED);
    }

    pub fn remove_node(&mut self, path: &NodePath) {
        let revision = self.revision;
        self.op_mut(path, false)
            .set_map_entry(DELETED, revision, Some("true".to_string()));
        self.touch(path, DELETED);
    }

    /// Stages a property write; `None` records the delete marker.
    pub fn update_property(&mut self, path: &NodePath, name: &str, value: Option<String>) {
        let revision = self.revision;
        let key = escape_property_name(name);
        self.op_mut(path, false)
            .set_map_entry(key.clone(), revision, value);
        self.touch(path, &key);
    }

    fn commit_root_path(&self) -> NodePath {
        let mut paths = self.operations.keys();
        let mut root = paths.next().expect("empty commit has no root").clone();
        for path in paths {
            root = root.common_ancestor(path);
        }
        root
    }

    fn rollback(&self, store: &dyn DocumentStore, applied: &[UpdateOp]) {
        for op in applied.iter().rev() {
            if let Err(err) = store.create_or_update(Collection::Nodes, &op.reverse_operation()) {
                tracing::warn!(id = op.id(), ?err, "rollback of partial commit failed");
            }
        }
    }

    /// Applies the commit (§4.7). On success the commit marker is in place
    /// and the revision is visible; on conflict every applied operation has
    /// been reversed.
    pub fn apply(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
    ) -> CommitResult<AppliedCommit> {
        assert!(!self.is_empty(), "empty commit");
        let commit_root = self.commit_root_path();
        let revision = self.revision;
        let last_rev_key = Revision::new(0, 0, ctx.cluster_id());
        let modified = modified_seconds(revision.timestamp());

        let mut applied: Vec<UpdateOp> = vec![];
        let mut priors = vec![];
        for (path, op) in &self.operations {
            let mut op = op.clone();
            op.set_map_entry(LAST_REV, last_rev_key, Some(revision.to_string()));
            op.max(MODIFIED, modified);
            if *path != commit_root {
                op.set_map_entry(
                    COMMIT_ROOT,
                    revision,
                    Some(commit_root.depth().to_string()),
                );
            }
            match store.create_or_update(Collection::Nodes, &op) {
                Ok(prior) => {
                    priors.push((path.clone(), prior));
                    applied.push(op);
                }
                Err(DocumentStoreError::ConditionFailed(id)) => {
                    self.rollback(store, &applied);
                    return Err(CommitError::Conflict(format!(
                        "update condition failed for {id}"
                    )));
                }
                Err(DocumentStoreError::Store(err)) => {
                    self.rollback(store, &applied);
                    return Err(err.into());
                }
            }
        }

        let mut exclude = self.excluded.clone();
        exclude.push(revision);
        for (path, prior) in &priors {
            let Some(prior) = prior else {
                continue;
            };
            let doc = match NodeDocument::new(prior.clone()) {
                Ok(doc) => doc,
                Err(err) => {
                    self.rollback(store, &applied);
                    return Err(err.into());
                }
            };
            let mut keys = self.touched_keys.get(path).cloned().unwrap_or_default();
            // An existence change under this commit is always a conflict,
            // whether or not this commit touched `_deleted` itself.
            if !keys.iter().any(|k| k == DELETED) {
                keys.push(DELETED.to_string());
            }
            let changes = match doc.newest_conflicting_changes(
                store,
                ctx,
                keys,
                &self.base_revision,
                &exclude,
            ) {
                Ok(changes) => changes,
                Err(err) => {
                    self.rollback(store, &applied);
                    return Err(err.into());
                }
            };
            if let Some(conflicting) = changes.committed.first() {
                self.rollback(store, &applied);
                return Err(CommitError::Conflict(format!(
                    "concurrent change on {path} committed at {conflicting}"
                )));
            }
            for uncommitted in &changes.uncommitted {
                // An unmerged branch changed this document too. The trunk
                // commit proceeds; the mark makes the branch merge fail.
                if let Err(err) = mark_collision(store, ctx, &doc, uncommitted) {
                    tracing::warn!(?err, revision = %uncommitted, "failed to mark collision");
                }
            }
        }

        let marker_value = match &self.branch_base {
            Some(base) => base.to_string(),
            None => "c".to_string(),
        };
        let mut marker = UpdateOp::new(commit_root.document_id(), false);
        marker.contains_map_entry(COLLISIONS, revision, false);
        marker.set_map_entry(REVISIONS, revision, Some(marker_value));
        marker.set_map_entry(LAST_REV, last_rev_key, Some(revision.to_string()));
        marker.max(MODIFIED, modified);
        match store.create_or_update(Collection::Nodes, &marker) {
            Ok(_) => {}
            Err(DocumentStoreError::ConditionFailed(_)) => {
                self.rollback(store, &applied);
                return Err(CommitError::Conflict(format!(
                    "commit {revision} collided with another branch"
                )));
            }
            Err(DocumentStoreError::Store(err)) => {
                self.rollback(store, &applied);
                return Err(err.into());
            }
        }

        Ok(AppliedCommit {
            commit_root,
            touched: self
                .touched_keys
                .iter()
                .map(|(path, keys)| (path.clone(), keys.clone()))
                .collect(),
        })
    }
}

/// Marks `revision` (an unmerged branch commit) as collided on its commit
/// root document, so its branch cannot merge any more.
pub fn mark_collision(
    store: &dyn DocumentStore,
    ctx: &dyn RevisionContext,
    seen_on: &NodeDocument,
    revision: &Revision,
) -> StoreResult<()> {
    let target_id = if seen_on
        .local_commit_value(store, ctx, revision)?
        .is_some()
    {
        seen_on.document().id().to_string()
    } else if let Some(depth) = seen_on.map_entry(store, ctx, COMMIT_ROOT, revision)?.flatten() {
        let depth: usize = depth.parse().unwrap_or(0);
        seen_on
            .path()
            .ancestor(depth.min(seen_on.path().depth()))
            .document_id()
    } else {
        seen_on.document().id().to_string()
    };
    let mut op = UpdateOp::new(target_id, false);
    op.set_map_entry(COLLISIONS, *revision, Some("true".to_string()));
    match store.create_or_update(Collection::Nodes, &op) {
        Ok(_) => Ok(()),
        Err(DocumentStoreError::ConditionFailed(id)) => {
            tracing::warn!(id, "collision mark rejected");
            Ok(())
        }
        Err(DocumentStoreError::Store(err)) => Err(err),
    }
}

/// Serializes the difference between `before` and `after` at `path` into the
/// commit. Memory states are walked by their recorded changes; any other
/// state pairing falls back to a structural comparison.
pub fn serialize_changes(
    commit: &mut Commit,
    path: &NodePath,
    before: &dyn NodeState,
    after: &dyn NodeState,
) -> StoreResult<()> {
    if let Some(memory) = after.as_any().downcast_ref::<MemoryNodeState>() {
        if before.exists() && !memory.base().exists() {
            // The node was replaced (removed and re-created): the recorded
            // changes are relative to nothing, so walk the full difference.
            let mut diff = CommitDiff {
                commit,
                path: path.clone(),
            };
            compare_node_states(before, after, &mut diff)?;
            return Ok(());
        }
        for (name, value) in memory.property_changes() {
            match value {
                Some(value) => {
                    let unchanged = before
                        .property(name)?
                        .is_some_and(|p| p.value() == value);
                    if !unchanged {
                        commit.update_property(path, name, Some(value.encode()));
                    }
                }
                None => {
                    if before.property(name)?.is_some() {
                        commit.update_property(path, name, None);
                    }
                }
            }
        }
        for (name, child) in memory.child_changes() {
            let child_path = path.join(name);
            let before_child = before.child(name)?;
            match child {
                Some(state) => {
                    if before_child.exists() {
                        serialize_changes(
                            commit,
                            &child_path,
                            before_child.as_ref(),
                            state.as_ref(),
                        )?;
                    } else {
                        add_subtree(commit, &child_path, state.as_ref())?;
                    }
                }
                None => {
                    if before_child.exists() {
                        remove_subtree(commit, &child_path, before_child.as_ref())?;
                    }
                }
            }
        }
        return Ok(());
    }

    let mut diff = CommitDiff {
        commit,
        path: path.clone(),
    };
    compare_node_states(before, after, &mut diff)?;
    Ok(())
}

fn add_subtree(commit: &mut Commit, path: &NodePath, state: &dyn NodeState) -> StoreResult<()> {
    commit.add_node(path);
    for property in state.properties()? {
        commit.update_property(path, property.name(), Some(property.value().encode()));
    }
    for name in state.child_names()? {
        add_subtree(commit, &path.join(&name), state.child(&name)?.as_ref())?;
    }
    Ok(())
}

fn remove_subtree(commit: &mut Commit, path: &NodePath, state: &dyn NodeState) -> StoreResult<()> {
    commit.remove_node(path);
    for name in state.child_names()? {
        remove_subtree(commit, &path.join(&name), state.child(&name)?.as_ref())?;
    }
    Ok(())
}

struct CommitDiff<'a> {
    commit: &'a mut Commit,
    path: NodePath,
}

impl NodeStateDiff for CommitDiff<'_> {
    fn property_added(&mut self, after: &PropertyState) -> StoreResult<bool> {
        self.commit
            .update_property(&self.path, after.name(), Some(after.value().encode()));
        Ok(true)
    }

    fn property_changed(
        &mut self,
        _before: &PropertyState,
        after: &PropertyState,
    ) -> StoreResult<bool> {
        self.commit
            .update_property(&self.path, after.name(), Some(after.value().encode()));
        Ok(true)
    }

    fn property_deleted(&mut self, before: &PropertyState) -> StoreResult<bool> {
        self.commit.update_property(&self.path, before.name(), None);
        Ok(true)
    }

    fn child_node_added(&mut self, name: &str, after: &dyn NodeState) -> StoreResult<bool> {
        add_subtree(self.commit, &self.path.join(name), after)?;
        Ok(true)
    }

    fn child_node_changed(
        &mut self,
        name: &str,
        before: &dyn NodeState,
        after: &dyn NodeState,
    ) -> StoreResult<bool> {
        serialize_changes(self.commit, &self.path.join(name), before, after)?;
        Ok(true)
    }

    fn child_node_deleted(&mut self, name: &str, before: &dyn NodeState) -> StoreResult<bool> {
        remove_subtree(self.commit, &self.path.join(name), before)?;
        Ok(true)
    }
}
