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

//! Relocates old committed revisions from a primary document into a
//! previous document reachable via `_prev`, keeping the primary small.
//! Reads are unaffected: lookups descend into previous documents whose
//! range covers the revision.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use crate::document::document::{
    NodeDocument, RevisionContext, COMMIT_ROOT, ID, LAST_REV, MODIFIED, MOD_COUNT, PREV,
    REVISIONS,
};
use crate::document::store::DocumentStore;
use crate::document::update_op::UpdateOp;
use crate::node::StoreResult;
use crate::revision::Revision;

/// Split once the commit bookkeeping maps hold more than this many entries.
pub const REVISIONS_SPLIT_OFF_SIZE: usize = 100;

/// Split regardless of entry counts once the document's estimated footprint
/// exceeds this many bytes.
pub const FORCE_SPLIT_THRESHOLD: usize = 16 * 1024;

/// Keys that always stay in the primary document.
pub const IGNORE_ON_SPLIT: [&str; 5] = [ID, MOD_COUNT, MODIFIED, PREV, LAST_REV];

/// The operations of one split: the update trimming the primary document,
/// and the insert creating the previous document. `None` if the document is
/// below both thresholds or nothing is movable.
pub fn split_operations(
    doc: &NodeDocument,
    store: &dyn DocumentStore,
    ctx: &dyn RevisionContext,
) -> StoreResult<Option<(UpdateOp, UpdateOp)>> {
    let data = doc.document();
    let bookkeeping = data.get_map(REVISIONS).map_or(0, BTreeMap::len)
        + data.get_map(COMMIT_ROOT).map_or(0, BTreeMap::len);
    if bookkeeping <= REVISIONS_SPLIT_OFF_SIZE
        && data.estimated_memory() <= FORCE_SPLIT_THRESHOLD
    {
        return Ok(None);
    }

    let local = ctx.cluster_id();
    // Entries at or below the newest already-split window were moved by an
    // earlier split; never move them again.
    let split_floor = doc
        .previous_ranges()
        .into_iter()
        .filter(|(high, _)| high.cluster_id() == local)
        .map(|(high, _)| high)
        .next();

    let mut moved: BTreeMap<String, Vec<(Revision, Option<String>)>> = BTreeMap::new();
    let keys: Vec<String> = data
        .keys()
        .filter(|key| !IGNORE_ON_SPLIT.contains(key))
        .map(|key| key.to_string())
        .collect();
    for key in keys {
        let Some(map) = data.get_map(&key) else {
            continue;
        };
        // The newest local entry of each map stays in the primary document.
        let newest_local = map
            .keys()
            .rev()
            .find(|revision| revision.cluster_id() == local)
            .copied();
        let mut movable = vec![];
        for (revision, value) in map {
            if revision.cluster_id() != local {
                continue;
            }
            if Some(*revision) == newest_local {
                continue;
            }
            if let Some(floor) = &split_floor {
                if revision.compare_time(floor) != std::cmp::Ordering::Greater {
                    continue;
                }
            }
            // Uncommitted revisions are never split off.
            if !doc.is_committed(store, ctx, revision)? {
                continue;
            }
            movable.push((*revision, value.clone()));
        }
        if !movable.is_empty() {
            moved.insert(key, movable);
        }
    }

    let mut all_moved: Vec<Revision> = moved
        .values()
        .flat_map(|entries| entries.iter().map(|(revision, _)| *revision))
        .collect();
    if all_moved.is_empty() {
        return Ok(None);
    }
    all_moved.sort_by(|a, b| a.compare_time(b));
    let low = all_moved[0];
    let high = *all_moved.last().unwrap();

    let mut main_op = UpdateOp::new(data.id(), false);
    let mut prev_op = UpdateOp::new(doc.path().previous_document_id(&high), true);
    for (key, entries) in &moved {
        for (revision, value) in entries {
            main_op.remove_map_entry(key.clone(), *revision);
            prev_op.set_map_entry(key.clone(), *revision, value.clone());
        }
    }
    main_op.set_map_entry(PREV, high, Some(low.to_string()));
    Ok(Some((main_op, prev_op)))
}
