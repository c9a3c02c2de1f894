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

use indexmap::IndexMap;

use crate::document::document::{Document, Scalar, MOD_COUNT};
use crate::revision::Revision;

/// Addresses one field of a document: a scalar by name, or one revision
/// entry of a revision-keyed map.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Key {
    pub name: String,
    pub revision: Option<Revision>,
}

impl Key {
    pub fn scalar(name: impl Into<String>) -> Self {
        Key {
            name: name.into(),
            revision: None,
        }
    }

    pub fn map_entry(name: impl Into<String>, revision: Revision) -> Self {
        Key {
            name: name.into(),
            revision: Some(revision.as_trunk_revision()),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Change {
    /// Insert or replace a map entry; `None` stores the delete marker.
    SetMapEntry(Option<String>),
    /// Remove a map entry entirely (used by the split machinery).
    RemoveMapEntry,
    Set(Scalar),
    Max(i64),
    Increment(i64),
    /// A pre-condition: the map entry must (not) exist for the update to
    /// apply.
    ContainsMapEntry(bool),
}

/// A conditional mutation of one document. Changes apply atomically, in
/// insertion order, if all conditions hold.
#[derive(Clone, Debug)]
pub struct UpdateOp {
    id: String,
    is_new: bool,
    changes: IndexMap<Key, Change>,
}

impl UpdateOp {
    pub fn new(id: impl Into<String>, is_new: bool) -> Self {
        UpdateOp {
            id: id.into(),
            is_new,
            changes: IndexMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> impl Iterator<Item = (&Key, &Change)> {
        self.changes.iter()
    }

    pub fn set_map_entry(
        &mut self,
        name: impl Into<String>,
        revision: Revision,
        value: Option<String>,
    ) -> &mut Self {
        self.changes
            .insert(Key::map_entry(name, revision), Change::SetMapEntry(value));
        self
    }

    pub fn remove_map_entry(&mut self, name: impl Into<String>, revision: Revision) -> &mut Self {
        self.changes
            .insert(Key::map_entry(name, revision), Change::RemoveMapEntry);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Scalar) -> &mut Self {
        self.changes.insert(Key::scalar(name), Change::Set(value));
        self
    }

    pub fn max(&mut self, name: impl Into<String>, value: i64) -> &mut Self {
        self.changes.insert(Key::scalar(name), Change::Max(value));
        self
    }

    pub fn increment(&mut self, name: impl Into<String>, by: i64) -> &mut Self {
        self.changes
            .insert(Key::scalar(name), Change::Increment(by));
        self
    }

    pub fn contains_map_entry(
        &mut self,
        name: impl Into<String>,
        revision: Revision,
        exists: bool,
    ) -> &mut Self {
        self.changes
            .insert(Key::map_entry(name, revision), Change::ContainsMapEntry(exists));
        self
    }

    /// The operation that undoes this one's map-entry writes and counter
    /// increments. Used to roll back partially applied commits; scalar sets
    /// and conditions have no reverse.
    pub fn reverse_operation(&self) -> UpdateOp {
        let mut reverse = UpdateOp::new(self.id.clone(), false);
        for (key, change) in &self.changes {
            match change {
                Change::SetMapEntry(_) => {
                    reverse
                        .changes
                        .insert(key.clone(), Change::RemoveMapEntry);
                }
                Change::Increment(by) => {
                    reverse.changes.insert(key.clone(), Change::Increment(-by));
                }
                Change::RemoveMapEntry
                | Change::Set(_)
                | Change::Max(_)
                | Change::ContainsMapEntry(_) => {}
            }
        }
        reverse
    }
}

/// Whether all `ContainsMapEntry` conditions of `op` hold against `doc`.
pub fn check_conditions(doc: Option<&Document>, op: &UpdateOp) -> bool {
    for (key, change) in op.changes() {
        if let Change::ContainsMapEntry(expected) = change {
            let revision = key
                .revision
                .expect("ContainsMapEntry condition without a revision");
            let contains = doc
                .and_then(|d| d.get_map(&key.name))
                .is_some_and(|map| map.contains_key(&revision));
            if contains != *expected {
                return false;
            }
        }
    }
    true
}

/// Applies `op`'s changes to `doc` and bumps its `_modCount`. Conditions
/// must have been checked already.
pub fn apply_changes(doc: &mut Document, op: &UpdateOp) {
    for (key, change) in op.changes() {
        match change {
            Change::SetMapEntry(value) => {
                let revision = key.revision.expect("map entry without a revision");
                doc.map_mut(&key.name).insert(revision, value.clone());
            }
            Change::RemoveMapEntry => {
                let revision = key.revision.expect("map entry without a revision");
                doc.map_mut(&key.name).remove(&revision);
            }
            Change::Set(value) => {
                doc.set_scalar(key.name.clone(), value.clone());
            }
            Change::Max(value) => {
                if doc.get_long(&key.name).map_or(true, |current| *value > current) {
                    doc.set_scalar(key.name.clone(), Scalar::Long(*value));
                }
            }
            Change::Increment(by) => {
                let current = doc.get_long(&key.name).unwrap_or(0);
                doc.set_scalar(key.name.clone(), Scalar::Long(current + by));
            }
            Change::ContainsMapEntry(_) => {}
        }
    }
    let mod_count = doc.mod_count();
    doc.set_scalar(MOD_COUNT.to_string(), Scalar::Long(mod_count + 1));
}
