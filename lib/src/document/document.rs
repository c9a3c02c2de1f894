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

//! The multi-version node document model. Each node is stored as a document
//! whose property values are revision-keyed maps; commit markers on the
//! commit-root document decide which revisions a reader sees.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashSet};
use std::fmt::{Debug, Formatter};

use crate::document::branch::UnmergedBranches;
use crate::document::store::{Collection, DocumentStore};
use crate::node::{StoreError, StoreResult};
use crate::path::NodePath;
use crate::property::{PropertyValue, ValueEncodingError};
use crate::revision::{Revision, RevisionComparator};

pub const ID: &str = "_id";
pub const MOD_COUNT: &str = "_modCount";
pub const MODIFIED: &str = "_modified";
pub const REVISIONS: &str = "_revisions";
pub const COMMIT_ROOT: &str = "_commitRoot";
pub const DELETED: &str = "_deleted";
pub const LAST_REV: &str = "_lastRev";
pub const PREV: &str = "_prev";
pub const COLLISIONS: &str = "_collisions";

/// A scalar document field value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Scalar {
    String(String),
    Long(i64),
    Bool(bool),
}

/// A revision-keyed map. `None` values are delete markers: the key existed
/// and was removed at that revision.
pub type RevMap = BTreeMap<Revision, Option<String>>;

/// A document field is either a scalar or a revision-keyed map.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DocValue {
    Scalar(Scalar),
    Map(RevMap),
}

/// What the engines need from their surrounding store instance to resolve
/// revision visibility.
pub trait RevisionContext: Send + Sync {
    fn cluster_id(&self) -> u32;
    fn comparator(&self) -> &RevisionComparator;
    fn branches(&self) -> &UnmergedBranches;
}

/// A raw record of the document store: an id plus named fields.
#[derive(Clone, Default, PartialEq)]
pub struct Document {
    data: BTreeMap<String, DocValue>,
}

impl Debug for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id())
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        let mut doc = Document::default();
        doc.data
            .insert(ID.to_string(), DocValue::Scalar(Scalar::String(id.into())));
        doc
    }

    pub fn id(&self) -> &str {
        match self.data.get(ID) {
            Some(DocValue::Scalar(Scalar::String(id))) => id,
            _ => "",
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&DocValue> {
        self.data.get(key)
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.data.get(key) {
            Some(DocValue::Scalar(Scalar::Long(value))) => Some(*value),
            _ => None,
        }
    }

    pub fn get_map(&self, key: &str) -> Option<&RevMap> {
        match self.data.get(key) {
            Some(DocValue::Map(map)) => Some(map),
            _ => None,
        }
    }

    pub fn set_scalar(&mut self, key: impl Into<String>, value: Scalar) {
        self.data.insert(key.into(), DocValue::Scalar(value));
    }

    pub fn map_mut(&mut self, key: &str) -> &mut RevMap {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| DocValue::Map(RevMap::new()));
        match entry {
            DocValue::Map(map) => map,
            DocValue::Scalar(_) => {
                *entry = DocValue::Map(RevMap::new());
                match entry {
                    DocValue::Map(map) => map,
                    DocValue::Scalar(_) => unreachable!(),
                }
            }
        }
    }

    pub fn remove_field(&mut self, key: &str) {
        self.data.remove(key);
    }

    pub fn mod_count(&self) -> i64 {
        self.get_long(MOD_COUNT).unwrap_or(0)
    }

    /// A coarse estimate of this document's in-memory footprint in bytes.
    pub fn estimated_memory(&self) -> usize {
        let mut size = 0;
        for (key, value) in &self.data {
            size += key.len() + 16;
            match value {
                DocValue::Scalar(Scalar::String(s)) => size += s.len(),
                DocValue::Scalar(_) => size += 8,
                DocValue::Map(map) => {
                    for value in map.values() {
                        size += 24 + value.as_ref().map_or(0, String::len);
                    }
                }
            }
        }
        size
    }
}

/// True for `"c"` and `"c-<rev>"` commit markers.
pub fn is_committed_value(value: &str) -> bool {
    value.starts_with('c')
}

/// For a committed marker, the revision at which the commit became visible:
/// the embedded merge revision for `"c-<rev>"`, the commit revision itself
/// for `"c"`.
pub fn resolve_commit_revision(revision: Revision, value: &str) -> Revision {
    match value.strip_prefix("c-") {
        Some(merge) => Revision::parse(merge).unwrap_or(revision),
        None => revision,
    }
}

/// User property names are escaped so they can never collide with system
/// keys: a leading underscore is doubled.
pub fn escape_property_name(name: &str) -> String {
    if name.starts_with('_') {
        format!("_{name}")
    } else {
        name.to_string()
    }
}

pub fn unescape_property_name(key: &str) -> &str {
    key.strip_prefix('_').filter(|_| key.starts_with("__")).unwrap_or(key)
}

fn is_user_property_key(key: &str) -> bool {
    !key.starts_with('_') || key.starts_with("__")
}

/// The resolved content of one node at one revision. Plain data; the
/// `NodeState` wrapper adds child lookups.
#[derive(Clone, Debug)]
pub struct DocumentNode {
    pub path: NodePath,
    pub read_revision: Revision,
    pub last_revision: Option<Revision>,
    pub properties: BTreeMap<String, PropertyValue>,
}

/// Engine logic over a node [`Document`].
pub struct NodeDocument {
    doc: Document,
    path: NodePath,
}

impl Debug for NodeDocument {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDocument")
            .field("id", &self.doc.id())
            .finish_non_exhaustive()
    }
}

impl NodeDocument {
    pub fn new(doc: Document) -> StoreResult<Self> {
        let path = NodePath::from_document_id(doc.id()).ok_or_else(|| {
            StoreError::Corruption(format!("document id {:?} has no path", doc.id()))
        })?;
        Ok(NodeDocument { doc, path })
    }

    /// Wraps a previous (split-off) document, whose id does not carry a node
    /// path; it belongs to the lineage of the node at `path`.
    pub fn with_path(doc: Document, path: NodePath) -> Self {
        NodeDocument { doc, path }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    /// The `_prev` ranges, newest window first, ties broken by cluster id.
    pub fn previous_ranges(&self) -> Vec<(Revision, Revision)> {
        let mut ranges: Vec<(Revision, Revision)> = self
            .doc
            .get_map(PREV)
            .map(|map| {
                map.iter()
                    .filter_map(|(high, low)| {
                        let low = low.as_deref().and_then(|s| Revision::parse(s).ok())?;
                        Some((*high, low))
                    })
                    .collect()
            })
            .unwrap_or_default();
        ranges.sort_by(|(a, _), (b, _)| {
            b.compare_time(a)
                .then_with(|| a.cluster_id().cmp(&b.cluster_id()))
        });
        ranges
    }

    fn previous_document(
        &self,
        store: &dyn DocumentStore,
        high: &Revision,
    ) -> StoreResult<Option<NodeDocument>> {
        let id = self.path.previous_document_id(high);
        match store.find(Collection::Nodes, &id)? {
            Some(doc) => Ok(Some(NodeDocument::with_path(doc, self.path.clone()))),
            None => {
                tracing::warn!(id, "previous document not found, treating as hole");
                Ok(None)
            }
        }
    }

    fn range_includes(
        ctx: &dyn RevisionContext,
        revision: &Revision,
        high: &Revision,
        low: &Revision,
    ) -> bool {
        let comparator = ctx.comparator();
        comparator.compare(revision, low) != std::cmp::Ordering::Less
            && comparator.compare(revision, high) != std::cmp::Ordering::Greater
    }

    /// The value of `map[revision]`, consulting split-off previous documents
    /// whose range covers the revision.
    pub fn map_entry(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
        key: &str,
        revision: &Revision,
    ) -> StoreResult<Option<Option<String>>> {
        let revision = revision.as_trunk_revision();
        if let Some(map) = self.doc.get_map(key) {
            if let Some(value) = map.get(&revision) {
                return Ok(Some(value.clone()));
            }
        }
        for (high, low) in self.previous_ranges() {
            if !Self::range_includes(ctx, &revision, &high, &low) {
                continue;
            }
            if let Some(prev) = self.previous_document(store, &high)? {
                if let Some(value) = prev.map_entry(store, ctx, key, &revision)? {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    /// The full revision map for `key`, merged across this document and all
    /// reachable previous documents. Iterating in reverse yields entries in
    /// descending revision order.
    pub fn merged_map(
        &self,
        store: &dyn DocumentStore,
        key: &str,
    ) -> StoreResult<RevMap> {
        let mut merged = self.doc.get_map(key).cloned().unwrap_or_default();
        for (high, _low) in self.previous_ranges() {
            if let Some(prev) = self.previous_document(store, &high)? {
                for (revision, value) in prev.merged_map(store, key)? {
                    merged.entry(revision).or_insert(value);
                }
            }
        }
        Ok(merged)
    }

    /// The commit marker for `revision` if this document (or its previous
    /// chain) is the commit root for it.
    pub fn local_commit_value(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
        revision: &Revision,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .map_entry(store, ctx, REVISIONS, revision)?
            .flatten())
    }

    /// Resolves the commit marker for `revision`, following the
    /// `_commitRoot` pointer to the commit-root ancestor when this node is
    /// not itself the commit root.
    pub fn commit_value(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
        revision: &Revision,
    ) -> StoreResult<Option<String>> {
        if let Some(value) = self.local_commit_value(store, ctx, revision)? {
            return Ok(Some(value));
        }
        let Some(depth) = self.map_entry(store, ctx, COMMIT_ROOT, revision)?.flatten() else {
            return Ok(None);
        };
        let depth: usize = depth.parse().map_err(|_| {
            StoreError::Corruption(format!(
                "invalid commit root depth {depth:?} on {}",
                self.doc.id()
            ))
        })?;
        if depth > self.path.depth() {
            return Err(StoreError::Corruption(format!(
                "commit root depth {depth} exceeds path depth of {}",
                self.doc.id()
            )));
        }
        let root_path = self.path.ancestor(depth);
        let Some(root_doc) = store.find(Collection::Nodes, &root_path.document_id())? else {
            return Ok(None);
        };
        NodeDocument::new(root_doc)?.local_commit_value(store, ctx, revision)
    }

    pub fn is_committed(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
        revision: &Revision,
    ) -> StoreResult<bool> {
        Ok(self
            .commit_value(store, ctx, revision)?
            .is_some_and(|v| is_committed_value(&v)))
    }

    /// Whether `revision` is visible to a reader at `read_revision` (§4.6).
    /// Positive results are memoized in `valid_revisions`.
    pub fn is_valid_revision(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
        revision: &Revision,
        read_revision: &Revision,
        valid_revisions: &mut HashSet<Revision>,
    ) -> StoreResult<bool> {
        if valid_revisions.contains(&revision.as_trunk_revision()) {
            return Ok(true);
        }
        let Some(value) = self.commit_value(store, ctx, revision)? else {
            return Ok(false);
        };
        let comparator = ctx.comparator();
        let visible = if is_committed_value(&value) {
            let merge_revision = resolve_commit_revision(*revision, &value);
            if read_revision.is_branch() {
                let read_trunk = read_revision.as_trunk_revision();
                if self.local_commit_value(store, ctx, &read_trunk)? == Some(value.clone()) {
                    // The reader sits on a commit of the same merged branch:
                    // both revisions carry the same marker. Branch-internal
                    // order decides, not the merge revision.
                    revision.compare_time(&read_trunk) != std::cmp::Ordering::Greater
                } else {
                    // A live branch reader sees trunk commits up to its base;
                    // its own commits are handled in the unmerged arm.
                    match ctx.branches().base_of(read_revision) {
                        Some(base) => !comparator.is_newer(&merge_revision, &base),
                        None => !comparator.is_newer(&merge_revision, &read_trunk),
                    }
                }
            } else {
                !comparator.is_newer(&merge_revision, read_revision)
            }
        } else {
            // An unmerged branch commit: only visible to a reader on the same
            // branch, and only for commits at or before the read revision.
            revision.cluster_id() == ctx.cluster_id()
                && read_revision.is_branch()
                && ctx.branches().contains_commit(read_revision, revision)
                && revision.compare_time(&read_revision.as_trunk_revision())
                    != std::cmp::Ordering::Greater
        };
        if visible {
            valid_revisions.insert(revision.as_trunk_revision());
        }
        Ok(visible)
    }

    /// Resolves this node's content as seen by a reader at `read_revision`.
    /// Returns `None` if the node does not exist at that revision.
    pub fn node_at_revision(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
        read_revision: &Revision,
    ) -> StoreResult<Option<DocumentNode>> {
        let mut valid_revisions = HashSet::new();
        let deleted = self.merged_map(store, DELETED)?;
        let mut exists = false;
        let mut last_revision: Option<Revision> = None;
        for (revision, value) in deleted.iter().rev() {
            if self.is_valid_revision(store, ctx, revision, read_revision, &mut valid_revisions)? {
                exists = value.as_deref() == Some("false");
                last_revision = Some(*revision);
                break;
            }
        }
        if !exists {
            return Ok(None);
        }

        let mut properties = BTreeMap::new();
        let keys: Vec<String> = self
            .doc
            .keys()
            .filter(|k| is_user_property_key(k))
            .map(|k| k.to_string())
            .collect();
        for key in keys {
            let map = self.merged_map(store, &key)?;
            for (revision, value) in map.iter().rev() {
                if self.is_valid_revision(
                    store,
                    ctx,
                    revision,
                    read_revision,
                    &mut valid_revisions,
                )? {
                    if let Some(encoded) = value {
                        let decoded = PropertyValue::decode(encoded).map_err(
                            |ValueEncodingError::Malformed(v)| {
                                StoreError::Corruption(format!(
                                    "malformed property value {v:?} on {}",
                                    self.doc.id()
                                ))
                            },
                        )?;
                        properties.insert(unescape_property_name(&key).to_string(), decoded);
                    }
                    if last_revision
                        .as_ref()
                        .map_or(true, |last| ctx.comparator().is_newer(revision, last))
                    {
                        last_revision = Some(*revision);
                    }
                    break;
                }
            }
        }

        Ok(Some(DocumentNode {
            path: self.path.clone(),
            read_revision: *read_revision,
            last_revision,
            properties,
        }))
    }

    /// The newest committed change to any of the given map keys that is
    /// newer than `base`, plus any newer uncommitted revisions (candidate
    /// collisions).
    pub fn newest_conflicting_changes(
        &self,
        store: &dyn DocumentStore,
        ctx: &dyn RevisionContext,
        keys: impl IntoIterator<Item = String>,
        base: &Revision,
        own: &[Revision],
    ) -> StoreResult<ConflictingChanges> {
        let comparator = ctx.comparator();
        let mut result = ConflictingChanges::default();
        for key in keys {
            let Some(map) = self.doc.get_map(&key) else {
                continue;
            };
            for revision in map.keys() {
                if own.iter().any(|o| revision.equals_ignore_branch(o)) {
                    continue;
                }
                if !comparator.is_newer(revision, base) {
                    continue;
                }
                if self.is_committed(store, ctx, revision)? {
                    result.committed.push(*revision);
                } else {
                    result.uncommitted.push(*revision);
                }
            }
        }
        Ok(result)
    }
}

/// Revisions found by a conflict scan, split by commit state.
#[derive(Debug, Default)]
pub struct ConflictingChanges {
    pub committed: Vec<Revision>,
    pub uncommitted: Vec<Revision>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        for name in ["p", "_p", "__p", "normal"] {
            let escaped = escape_property_name(name);
            assert!(is_user_property_key(&escaped), "{escaped:?}");
            assert_eq!(unescape_property_name(&escaped), name);
        }
        assert!(!is_user_property_key(REVISIONS));
        assert!(!is_user_property_key(DELETED));
    }

    #[test]
    fn resolve_commit_revision_strips_merge_prefix() {
        let r = Revision::parse("r5-0-1").unwrap();
        assert_eq!(resolve_commit_revision(r, "c"), r);
        let merge = Revision::parse("r8-0-1").unwrap();
        assert_eq!(resolve_commit_revision(r, "c-r8-0-1"), merge);
    }

    #[test]
    fn document_map_access() {
        let mut doc = Document::new("1:/x");
        let r = Revision::parse("r1-0-1").unwrap();
        doc.map_mut(DELETED).insert(r, Some("false".to_string()));
        assert_eq!(doc.get_map(DELETED).unwrap().len(), 1);
        assert_eq!(doc.id(), "1:/x");
        assert!(doc.estimated_memory() > 0);
    }
}
