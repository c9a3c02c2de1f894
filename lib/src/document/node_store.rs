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

//! The document-backed [`NodeStore`]: multi-version node documents over an
//! external document store, with trunk commits, persisted branches and
//! best-effort splitting of oversized documents.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::io::Read;
use std::sync::{Arc, Mutex, RwLock};

use crate::blob::{Blob, MemoryBlobStore};
use crate::commit_hook::{CommitHook, Observer};
use crate::document::branch::{BranchCommit, UnmergedBranches};
use crate::document::commit::{serialize_changes, AppliedCommit, Commit};
use crate::document::document::{
    DocumentNode, NodeDocument, RevisionContext, COLLISIONS, DELETED, LAST_REV, REVISIONS,
};
use crate::document::node_state::{DocumentNodeState, DocumentReader};
use crate::document::split::split_operations;
use crate::document::store::{Collection, DocumentStore, DocumentStoreError};
use crate::document::update_op::UpdateOp;
use crate::memory::MemoryNodeState;
use crate::node::{NodeState, StoreError, StoreResult};
use crate::node_store::{CommitError, CommitResult, NodeStore, NodeStoreBranch};
use crate::path::NodePath;
use crate::revision::{Clock, Revision, RevisionClock, RevisionComparator, SystemClock};

const CHILDREN_BATCH: usize = 1000;

pub(crate) struct Inner {
    store: Arc<dyn DocumentStore>,
    cluster_id: u32,
    revision_clock: RevisionClock,
    wall_clock: Arc<dyn Clock>,
    comparator: RevisionComparator,
    branches: UnmergedBranches,
    head: RwLock<Revision>,
    checkpoints: Mutex<HashMap<String, CheckpointInfo>>,
    blobs: MemoryBlobStore,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

struct CheckpointInfo {
    revision: Revision,
    expires_at_ms: u64,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentNodeStore")
            .field("cluster_id", &self.cluster_id)
            .field("head", &self.head.read().unwrap())
            .finish_non_exhaustive()
    }
}

impl RevisionContext for Inner {
    fn cluster_id(&self) -> u32 {
        self.cluster_id
    }

    fn comparator(&self) -> &RevisionComparator {
        &self.comparator
    }

    fn branches(&self) -> &UnmergedBranches {
        &self.branches
    }
}

impl DocumentReader for Inner {
    fn read_node(
        &self,
        path: &NodePath,
        revision: &Revision,
    ) -> StoreResult<Option<DocumentNode>> {
        let Some(doc) = self.store.find(Collection::Nodes, &path.document_id())? else {
            return Ok(None);
        };
        let node_doc = NodeDocument::new(doc)?;
        let mut node = node_doc.node_at_revision(self.store.as_ref(), self, revision)?;
        if revision.is_branch() {
            if let Some(node) = &mut node {
                if let Some(unsaved) = self.branches.unsaved_last_rev(revision, path) {
                    node.last_revision = Some(unsaved);
                }
            }
        }
        Ok(node)
    }

    fn read_child_names(&self, path: &NodePath, revision: &Revision) -> StoreResult<Vec<String>> {
        let (mut from, to) = path.children_id_range();
        let mut names = vec![];
        loop {
            let docs = self
                .store
                .query(Collection::Nodes, &from, &to, CHILDREN_BATCH)?;
            let batch_len = docs.len();
            for doc in docs {
                from = doc.id().to_string();
                let node_doc = NodeDocument::new(doc)?;
                if node_doc
                    .node_at_revision(self.store.as_ref(), self, revision)?
                    .is_some()
                {
                    names.push(node_doc.path().name().to_string());
                }
            }
            if batch_len < CHILDREN_BATCH {
                break;
            }
        }
        Ok(names)
    }
}

impl Inner {
    fn head_revision(&self) -> Revision {
        *self.head.read().unwrap()
    }

    fn publish_head(&self, revision: Revision) {
        let mut head = self.head.write().unwrap();
        if self.comparator.is_newer(&revision, &head) {
            *head = revision;
        }
    }
}

/// A node store backed by revision-keyed documents.
#[derive(Clone)]
pub struct DocumentNodeStore {
    inner: Arc<Inner>,
}

impl Debug for DocumentNodeStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl DocumentNodeStore {
    pub fn new(store: Arc<dyn DocumentStore>, cluster_id: u32) -> StoreResult<Self> {
        Self::with_clock(store, cluster_id, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn DocumentStore>,
        cluster_id: u32,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let revision_clock = RevisionClock::new(clock.clone());
        let root_id = NodePath::root().document_id();
        let head = loop {
            if let Some(doc) = store.find(Collection::Nodes, &root_id)? {
                break recover_head(&doc)?;
            }
            let revision = revision_clock.new_revision(cluster_id);
            let mut op = UpdateOp::new(root_id.clone(), true);
            op.set_map_entry(DELETED, revision, Some("false".to_string()));
            op.set_map_entry(REVISIONS, revision, Some("c".to_string()));
            op.set_map_entry(
                LAST_REV,
                Revision::new(0, 0, cluster_id),
                Some(revision.to_string()),
            );
            if store.create(Collection::Nodes, std::slice::from_ref(&op))? {
                break revision;
            }
        };
        Ok(DocumentNodeStore {
            inner: Arc::new(Inner {
                store,
                cluster_id,
                revision_clock,
                wall_clock: clock,
                comparator: RevisionComparator::new(cluster_id),
                branches: UnmergedBranches::new(),
                head: RwLock::new(head),
                checkpoints: Mutex::new(HashMap::new()),
                blobs: MemoryBlobStore::new(),
                observers: Mutex::new(vec![]),
            }),
        })
    }

    pub fn cluster_id(&self) -> u32 {
        self.inner.cluster_id
    }

    pub fn head_revision(&self) -> Revision {
        self.inner.head_revision()
    }

    pub fn document_store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub fn branches(&self) -> &UnmergedBranches {
        &self.inner.branches
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.inner.observers.lock().unwrap().push(observer);
    }

    /// Records a revision discovered from another cluster node; it becomes
    /// visible to readers whose read revision is at or after the current
    /// head.
    pub fn publish_revision(&self, foreign: Revision) {
        let seen_at = self.head_revision();
        self.inner.comparator.add(foreign, seen_at);
    }

    /// The root as of the given (possibly branch) revision.
    pub fn root_at(&self, revision: Revision) -> StoreResult<Arc<dyn NodeState>> {
        let reader: Arc<dyn DocumentReader> = self.inner.clone();
        let path = NodePath::root();
        let node = reader.read_node(&path, &revision)?;
        Ok(Arc::new(DocumentNodeState::new(reader, path, revision, node)))
    }

    fn new_revision(&self) -> Revision {
        self.inner.revision_clock.new_revision(self.inner.cluster_id)
    }

    fn notify_observers(&self) {
        let observers: Vec<_> = self.inner.observers.lock().unwrap().clone();
        if observers.is_empty() {
            return;
        }
        match self.root() {
            Ok(root) => {
                for observer in observers {
                    observer.content_changed(root.clone());
                }
            }
            Err(err) => tracing::warn!(?err, "cannot resolve root for observers"),
        }
    }

    fn commit_diff(
        &self,
        base_revision: Revision,
        before: &dyn NodeState,
        after: &dyn NodeState,
        branch_base: Option<Revision>,
        excluded: &[Revision],
    ) -> CommitResult<Option<(Revision, AppliedCommit)>> {
        let revision = self.new_revision();
        let mut commit = match branch_base {
            Some(base) => Commit::new_branch_commit(base_revision, revision, base),
            None => Commit::new(base_revision, revision),
        };
        commit.exclude_revisions(excluded.iter().copied());
        serialize_changes(&mut commit, &NodePath::root(), before, after)?;
        if commit.is_empty() {
            return Ok(None);
        }
        let applied = commit.apply(self.inner.store.as_ref(), &*self.inner)?;
        Ok(Some((commit.revision(), applied)))
    }

    fn merge_trunk(
        &self,
        base_revision: Revision,
        before: &dyn NodeState,
        after: &dyn NodeState,
    ) -> CommitResult<Revision> {
        match self.commit_diff(base_revision, before, after, None, &[])? {
            None => Ok(self.head_revision()),
            Some((revision, applied)) => {
                self.inner.publish_head(revision);
                self.after_commit(&applied);
                Ok(revision)
            }
        }
    }

    fn after_commit(&self, applied: &AppliedCommit) {
        for (path, _) in &applied.touched {
            if let Err(err) = self.split_if_needed(path) {
                tracing::warn!(?err, path = %path, "document split failed");
            }
        }
        self.notify_observers();
    }

    /// Splits the document at `path` if it exceeds the split thresholds.
    pub fn split_if_needed(&self, path: &NodePath) -> StoreResult<()> {
        let store = self.inner.store.as_ref();
        let Some(doc) = store.find(Collection::Nodes, &path.document_id())? else {
            return Ok(());
        };
        let node_doc = NodeDocument::new(doc)?;
        let Some((main_op, prev_op)) = split_operations(&node_doc, store, &*self.inner)? else {
            return Ok(());
        };
        if !store.create(Collection::Nodes, std::slice::from_ref(&prev_op))? {
            tracing::warn!(id = prev_op.id(), "previous document already exists");
            return Ok(());
        }
        match store.create_or_update(Collection::Nodes, &main_op) {
            Ok(_) => Ok(()),
            Err(DocumentStoreError::ConditionFailed(id)) => Err(StoreError::Corruption(format!(
                "unconditional split update rejected for {id}"
            ))),
            Err(DocumentStoreError::Store(err)) => Err(err),
        }
    }

    fn merge_persisted(&self, member: Revision) -> CommitResult<Revision> {
        let store = self.inner.store.as_ref();
        let ctx: &dyn RevisionContext = &*self.inner;
        let snapshot = self
            .inner
            .branches
            .snapshot(&member)
            .ok_or_else(|| CommitError::Conflict(format!("unknown branch for {member}")))?;
        let own: Vec<Revision> = snapshot.commits.iter().map(|c| c.revision).collect();

        for commit in &snapshot.commits {
            if let Some(doc) = store.find(Collection::Nodes, &commit.commit_root.document_id())? {
                if doc
                    .get_map(COLLISIONS)
                    .is_some_and(|map| map.contains_key(&commit.revision))
                {
                    return Err(CommitError::Conflict(format!(
                        "branch commit {} collided with a trunk commit",
                        commit.revision
                    )));
                }
            }
            for (path, keys) in &commit.touched {
                let Some(doc) = store.find(Collection::Nodes, &path.document_id())? else {
                    continue;
                };
                let node_doc = NodeDocument::new(doc)?;
                let mut keys = keys.clone();
                if !keys.iter().any(|k| k == DELETED) {
                    keys.push(DELETED.to_string());
                }
                let changes = node_doc.newest_conflicting_changes(
                    store,
                    ctx,
                    keys,
                    &snapshot.base,
                    &own,
                )?;
                if let Some(conflicting) = changes.committed.first() {
                    return Err(CommitError::Conflict(format!(
                        "concurrent change on {path} committed at {conflicting}"
                    )));
                }
            }
        }

        let merge_revision = self.new_revision();
        let mut rewritten: Vec<(NodePath, Revision)> = vec![];
        for commit in &snapshot.commits {
            let mut op = UpdateOp::new(commit.commit_root.document_id(), false);
            op.contains_map_entry(REVISIONS, commit.revision, true);
            op.set_map_entry(
                REVISIONS,
                commit.revision,
                Some(format!("c-{merge_revision}")),
            );
            match store.create_or_update(Collection::Nodes, &op) {
                Ok(_) => rewritten.push((commit.commit_root.clone(), commit.revision)),
                Err(err) => {
                    self.restore_markers(&rewritten, &snapshot.base);
                    return Err(match err {
                        DocumentStoreError::ConditionFailed(id) => CommitError::Conflict(
                            format!("branch commit marker missing on {id}"),
                        ),
                        DocumentStoreError::Store(err) => err.into(),
                    });
                }
            }
        }

        let mut root_op = UpdateOp::new(NodePath::root().document_id(), false);
        root_op.set_map_entry(REVISIONS, merge_revision, Some("c".to_string()));
        root_op.set_map_entry(
            LAST_REV,
            Revision::new(0, 0, self.inner.cluster_id),
            Some(merge_revision.to_string()),
        );
        if let Err(err) = store.create_or_update(Collection::Nodes, &root_op) {
            self.restore_markers(&rewritten, &snapshot.base);
            return Err(match err {
                DocumentStoreError::ConditionFailed(id) => {
                    CommitError::Conflict(format!("root update rejected for {id}"))
                }
                DocumentStoreError::Store(err) => err.into(),
            });
        }

        self.inner.branches.remove(&member);
        self.inner.publish_head(merge_revision);
        self.notify_observers();
        Ok(merge_revision)
    }

    /// Starts a branch, returned as the concrete type so callers can use
    /// [`DocumentNodeStoreBranch::persist`].
    pub fn create_branch(&self) -> StoreResult<DocumentNodeStoreBranch> {
        let base_revision = self.head_revision();
        let base_state = self.root_at(base_revision)?;
        Ok(DocumentNodeStoreBranch {
            store: self.clone(),
            base_revision,
            base_state: base_state.clone(),
            head_state: base_state,
            persisted_state: None,
            branch_member: None,
        })
    }

    fn restore_markers(&self, rewritten: &[(NodePath, Revision)], base: &Revision) {
        let store = self.inner.store.as_ref();
        for (path, revision) in rewritten.iter().rev() {
            let mut op = UpdateOp::new(path.document_id(), false);
            op.set_map_entry(REVISIONS, *revision, Some(base.to_string()));
            if let Err(err) = store.create_or_update(Collection::Nodes, &op) {
                tracing::warn!(?err, path = %path, "failed to restore branch marker");
            }
        }
    }
}

impl NodeStore for DocumentNodeStore {
    fn root(&self) -> StoreResult<Arc<dyn NodeState>> {
        self.root_at(self.head_revision())
    }

    fn branch(&self) -> StoreResult<Box<dyn NodeStoreBranch + '_>> {
        Ok(Box::new(self.create_branch()?))
    }

    fn checkpoint(&self, lifetime_ms: u64) -> StoreResult<String> {
        let revision = self.head_revision();
        let token = revision.to_string();
        let expires_at_ms = self.inner.wall_clock.now_millis().saturating_add(lifetime_ms);
        self.inner.checkpoints.lock().unwrap().insert(
            token.clone(),
            CheckpointInfo {
                revision,
                expires_at_ms,
            },
        );
        Ok(token)
    }

    fn retrieve(&self, checkpoint: &str) -> StoreResult<Option<Arc<dyn NodeState>>> {
        let revision = {
            let mut checkpoints = self.inner.checkpoints.lock().unwrap();
            match checkpoints.get(checkpoint) {
                None => return Ok(None),
                Some(info) if info.expires_at_ms < self.inner.wall_clock.now_millis() => {
                    checkpoints.remove(checkpoint);
                    return Ok(None);
                }
                Some(info) => info.revision,
            }
        };
        Ok(Some(self.root_at(revision)?))
    }

    fn create_blob(&self, content: &mut dyn Read) -> StoreResult<Arc<dyn Blob>> {
        self.inner.blobs.put(content)
    }
}

/// A branch over a [`DocumentNodeStore`]. Staged changes live in memory
/// until [`persist`](DocumentNodeStoreBranch::persist) writes them as
/// unmerged branch commits, or until a merge commits them to trunk.
pub struct DocumentNodeStoreBranch {
    store: DocumentNodeStore,
    base_revision: Revision,
    base_state: Arc<dyn NodeState>,
    head_state: Arc<dyn NodeState>,
    persisted_state: Option<Arc<dyn NodeState>>,
    branch_member: Option<Revision>,
}

impl DocumentNodeStoreBranch {
    /// The read revision for this branch's persisted head, if any commits
    /// were persisted.
    pub fn branch_revision(&self) -> Option<Revision> {
        self.branch_member.map(|r| r.as_branch_revision())
    }

    /// Writes the staged changes as an unmerged branch commit. They stay
    /// invisible to other readers until the branch is merged.
    pub fn persist(&mut self) -> CommitResult<()> {
        let before = self
            .persisted_state
            .clone()
            .unwrap_or_else(|| self.base_state.clone());
        let own_commits: Vec<_> = self
            .branch_member
            .and_then(|member| self.store.inner.branches.snapshot(&member))
            .map(|snapshot| snapshot.commits.iter().map(|c| c.revision).collect())
            .unwrap_or_default();
        let Some((revision, applied)) = self.store.commit_diff(
            self.base_revision,
            before.as_ref(),
            self.head_state.as_ref(),
            Some(self.base_revision),
            &own_commits,
        )?
        else {
            return Ok(());
        };
        let commit = BranchCommit {
            revision,
            commit_root: applied.commit_root.clone(),
            touched: applied.touched.clone(),
        };
        match &self.branch_member {
            Some(member) => self.store.inner.branches.add_commit(member, commit),
            None => self.store.inner.branches.create(self.base_revision, commit),
        }
        self.branch_member = Some(revision);
        let persisted = self.store.root_at(revision.as_branch_revision())?;
        self.persisted_state = Some(persisted.clone());
        self.head_state = persisted;
        Ok(())
    }
}

impl NodeStoreBranch for DocumentNodeStoreBranch {
    fn base(&self) -> Arc<dyn NodeState> {
        self.base_state.clone()
    }

    fn head(&self) -> Arc<dyn NodeState> {
        self.head_state.clone()
    }

    fn set_root(&mut self, state: Arc<dyn NodeState>) -> StoreResult<()> {
        self.head_state = state;
        Ok(())
    }

    fn rebase(&mut self) -> StoreResult<Arc<dyn NodeState>> {
        if self.branch_member.is_some() {
            // A persisted branch keeps its base until it is merged.
            return Ok(self.head_state.clone());
        }
        let new_base_revision = self.store.head_revision();
        let new_base = self.store.root_at(new_base_revision)?;
        self.head_state = match self.head_state.as_any().downcast_ref::<MemoryNodeState>() {
            Some(staged) => {
                let rebased: Arc<dyn NodeState> = staged.rebased(new_base.clone())?;
                rebased
            }
            None => new_base.clone(),
        };
        self.base_revision = new_base_revision;
        self.base_state = new_base;
        Ok(self.head_state.clone())
    }

    fn merge(&mut self, hook: &dyn CommitHook) -> CommitResult<Arc<dyn NodeState>> {
        let staged = hook.process_commit(self.base_state.as_ref(), self.head_state.clone())?;
        let new_root = if self.branch_member.is_some() {
            self.head_state = staged;
            self.persist()?;
            let member = self.branch_member.expect("branch member after persist");
            let merge_revision = self.store.merge_persisted(member)?;
            self.base_revision = merge_revision;
            self.store.root_at(merge_revision)?
        } else {
            let revision =
                self.store
                    .merge_trunk(self.base_revision, self.base_state.as_ref(), staged.as_ref())?;
            self.base_revision = revision;
            self.store.root_at(revision)?
        };
        self.base_state = new_root.clone();
        self.head_state = new_root.clone();
        self.persisted_state = None;
        self.branch_member = None;
        Ok(new_root)
    }
}

fn recover_head(doc: &crate::document::document::Document) -> StoreResult<Revision> {
    let mut head: Option<Revision> = None;
    if let Some(map) = doc.get_map(REVISIONS) {
        for revision in map.keys() {
            if head.map_or(true, |h| *revision > h) {
                head = Some(*revision);
            }
        }
    }
    if let Some(map) = doc.get_map(LAST_REV) {
        for value in map.values().flatten() {
            if let Ok(revision) = Revision::parse(value) {
                if head.map_or(true, |h| revision > h) {
                    head = Some(revision);
                }
            }
        }
    }
    head.ok_or_else(|| {
        StoreError::Corruption("root document has no committed revisions".to_string())
    })
}
