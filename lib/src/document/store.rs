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

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::ops::Bound;
use std::sync::Mutex;

use thiserror::Error;

use crate::document::document::Document;
use crate::document::update_op::{apply_changes, check_conditions, UpdateOp};
use crate::node::{StoreError, StoreResult};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Collection {
    Nodes,
    Settings,
}

#[derive(Debug, Error)]
pub enum DocumentStoreError {
    /// A `ContainsMapEntry` pre-condition did not hold; nothing was applied.
    #[error("update condition failed for {0}")]
    ConditionFailed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The external document store the document engine is layered over. Updates
/// must be atomic per document and honor `ContainsMapEntry` pre-conditions.
pub trait DocumentStore: Send + Sync + Debug {
    fn find(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>>;

    /// Documents with `from_id < id < to_id`, in id order, at most `limit`.
    fn query(
        &self,
        collection: Collection,
        from_id: &str,
        to_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Document>>;

    /// Applies `op`, creating the document if needed. Returns the document's
    /// prior state (`None` if it was just created).
    fn create_or_update(
        &self,
        collection: Collection,
        op: &UpdateOp,
    ) -> Result<Option<Document>, DocumentStoreError>;

    /// All-or-nothing insert of new documents. Returns `false` (without
    /// applying anything) if any of them already exists.
    fn create(&self, collection: Collection, ops: &[UpdateOp]) -> StoreResult<bool>;

    fn remove(&self, collection: Collection, id: &str) -> StoreResult<()>;
}

/// An in-memory document store, primarily for tests and small deployments.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<HashMap<Collection, BTreeMap<String, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        MemoryDocumentStore::default()
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn find(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn query(
        &self,
        collection: Collection,
        from_id: &str,
        to_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Document>> {
        let collections = self.collections.lock().unwrap();
        let Some(docs) = collections.get(&collection) else {
            return Ok(vec![]);
        };
        Ok(docs
            .range::<str, _>((Bound::Excluded(from_id), Bound::Excluded(to_id)))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    fn create_or_update(
        &self,
        collection: Collection,
        op: &UpdateOp,
    ) -> Result<Option<Document>, DocumentStoreError> {
        let mut collections = self.collections.lock().unwrap();
        let docs = collections.entry(collection).or_default();
        let existing = docs.get(op.id());
        if !check_conditions(existing, op) {
            return Err(DocumentStoreError::ConditionFailed(op.id().to_string()));
        }
        let prior = existing.cloned();
        let mut doc = prior.clone().unwrap_or_else(|| Document::new(op.id()));
        apply_changes(&mut doc, op);
        docs.insert(op.id().to_string(), doc);
        Ok(prior)
    }

    fn create(&self, collection: Collection, ops: &[UpdateOp]) -> StoreResult<bool> {
        let mut collections = self.collections.lock().unwrap();
        let docs = collections.entry(collection).or_default();
        if ops.iter().any(|op| docs.contains_key(op.id())) {
            return Ok(false);
        }
        for op in ops {
            let mut doc = Document::new(op.id());
            apply_changes(&mut doc, op);
            docs.insert(op.id().to_string(), doc);
        }
        Ok(true)
    }

    fn remove(&self, collection: Collection, id: &str) -> StoreResult<()> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(docs) = collections.get_mut(&collection) {
            docs.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::document::document::DELETED;
    use crate::revision::Revision;

    #[test]
    fn create_or_update_returns_prior_state() {
        let store = MemoryDocumentStore::new();
        let r = Revision::parse("r1-0-1").unwrap();
        let mut op = UpdateOp::new("1:/x", true);
        op.set_map_entry(DELETED, r, Some("false".to_string()));

        let prior = store.create_or_update(Collection::Nodes, &op).unwrap();
        assert!(prior.is_none());
        let prior = store.create_or_update(Collection::Nodes, &op).unwrap();
        assert_eq!(prior.unwrap().mod_count(), 1);
        assert_eq!(
            store
                .find(Collection::Nodes, "1:/x")
                .unwrap()
                .unwrap()
                .mod_count(),
            2
        );
    }

    #[test]
    fn conditions_reject_atomically() {
        let store = MemoryDocumentStore::new();
        let r = Revision::parse("r1-0-1").unwrap();
        let mut op = UpdateOp::new("1:/x", false);
        op.contains_map_entry(DELETED, r, true);
        op.set_map_entry("p", r, Some("s:v".to_string()));
        assert_matches!(
            store.create_or_update(Collection::Nodes, &op),
            Err(DocumentStoreError::ConditionFailed(_))
        );
        assert!(store.find(Collection::Nodes, "1:/x").unwrap().is_none());
    }

    #[test]
    fn create_is_all_or_nothing() {
        let store = MemoryDocumentStore::new();
        let r = Revision::parse("r1-0-1").unwrap();
        let mut a = UpdateOp::new("1:/a", true);
        a.set_map_entry(DELETED, r, Some("false".to_string()));
        assert!(store.create(Collection::Nodes, &[a.clone()]).unwrap());

        let mut b = UpdateOp::new("1:/b", true);
        b.set_map_entry(DELETED, r, Some("false".to_string()));
        assert!(!store
            .create(Collection::Nodes, &[b.clone(), a.clone()])
            .unwrap());
        assert!(store.find(Collection::Nodes, "1:/b").unwrap().is_none());
    }

    #[test]
    fn query_respects_range_and_limit() {
        let store = MemoryDocumentStore::new();
        let r = Revision::parse("r1-0-1").unwrap();
        for name in ["a", "b", "c"] {
            let mut op = UpdateOp::new(format!("1:/{name}"), true);
            op.set_map_entry(DELETED, r, Some("false".to_string()));
            store.create_or_update(Collection::Nodes, &op).unwrap();
        }
        let docs = store.query(Collection::Nodes, "1:/", "1:0", 10).unwrap();
        assert_eq!(docs.len(), 3);
        let docs = store.query(Collection::Nodes, "1:/", "1:0", 2).unwrap();
        assert_eq!(docs.len(), 2);
        let docs = store.query(Collection::Nodes, "1:/a", "1:/c", 10).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id(), "1:/b");
    }
}
