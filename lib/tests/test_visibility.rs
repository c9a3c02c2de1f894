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

use std::sync::Arc;

use canopy_lib::commit_hook::EmptyHook;
use canopy_lib::document::node_store::DocumentNodeStore;
use canopy_lib::document::store::MemoryDocumentStore;
use canopy_lib::node::NodeState;
use canopy_lib::node_store::NodeStore;
use canopy_lib::root::Root;
use testutils::{descend, FakeClock};

/// Two stores on one shared document store model two cluster writers.
fn two_cluster_fixture() -> (DocumentNodeStore, DocumentNodeStore, Arc<FakeClock>, Arc<FakeClock>) {
    let shared = Arc::new(MemoryDocumentStore::new());
    let clock1 = FakeClock::new();
    let clock2 = FakeClock::new();
    let store1 =
        DocumentNodeStore::with_clock(shared.clone(), 1, clock1.clone()).unwrap();
    let store2 = DocumentNodeStore::with_clock(shared, 2, clock2.clone()).unwrap();
    (store1, store2, clock1, clock2)
}

#[test]
fn revisions_stay_visible_at_later_read_revisions() {
    let store = testutils::new_document_store(1);
    let session = Root::new(&store).unwrap();
    session.tree("/").add_child("early").unwrap();
    session.commit(&EmptyHook).unwrap();
    let r1 = store.head_revision();

    let mut snapshots = vec![];
    for i in 0..5 {
        let session = Root::new(&store).unwrap();
        session.tree("/").add_child(&format!("later{i}")).unwrap();
        session.commit(&EmptyHook).unwrap();
        snapshots.push(store.head_revision());
    }

    // A change visible at r1 is visible at every later read revision.
    for revision in std::iter::once(r1).chain(snapshots) {
        let root = store.root_at(revision).unwrap();
        assert!(
            descend(root.as_ref(), "/early").unwrap().exists(),
            "early node invisible at {revision}"
        );
    }
}

#[test]
fn foreign_commits_become_visible_once_the_local_head_passes_them() {
    let (store1, store2, clock1, clock2) = two_cluster_fixture();

    // Cluster 2 commits at a timestamp ahead of cluster 1's head.
    clock2.advance(10_000);
    let session = Root::new(&store2).unwrap();
    session.tree("/").add_child("from2").unwrap();
    session.commit(&EmptyHook).unwrap();
    let foreign = store2.head_revision();

    // Cluster 1 still reads at an older head: the foreign commit is newer
    // than its read revision and therefore not visible.
    let root1 = store1.root().unwrap();
    assert!(!descend(root1.as_ref(), "/from2").unwrap().exists());

    // Once cluster 1's own head moves past the foreign timestamp, the
    // commit is within the read horizon.
    clock1.advance(60_000);
    let session = Root::new(&store1).unwrap();
    session.tree("/").add_child("from1").unwrap();
    session.commit(&EmptyHook).unwrap();
    store1.publish_revision(foreign);

    let root1 = store1.root().unwrap();
    assert!(descend(root1.as_ref(), "/from2").unwrap().exists());
    assert!(descend(root1.as_ref(), "/from1").unwrap().exists());
}

#[test]
fn last_revision_tracks_the_newest_visible_change() {
    let store = testutils::new_document_store(1);
    let session = Root::new(&store).unwrap();
    session.tree("/").add_child("n").unwrap();
    session.commit(&EmptyHook).unwrap();
    let first_head = store.head_revision();

    let session = Root::new(&store).unwrap();
    session
        .tree("/n")
        .set_property("p", canopy_lib::property::PropertyValue::Long(1))
        .unwrap();
    session.commit(&EmptyHook).unwrap();
    let second_head = store.head_revision();

    let root = store.root().unwrap();
    let n = descend(root.as_ref(), "/n").unwrap();
    let n = n
        .as_any()
        .downcast_ref::<canopy_lib::document::node_state::DocumentNodeState>()
        .unwrap();
    let last = n.last_revision().unwrap();
    assert!(last.equals_ignore_branch(&second_head));
    assert!(!last.equals_ignore_branch(&first_head));
}
