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

use assert_matches::assert_matches;
use canopy_lib::commit_hook::EmptyHook;
use canopy_lib::document::document::{COMMIT_ROOT, DELETED, NodeDocument};
use canopy_lib::document::store::{Collection, DocumentStore};
use canopy_lib::node::NodeState;
use canopy_lib::node_store::{CommitError, NodeStore};
use canopy_lib::property::PropertyValue;
use canopy_lib::root::Root;
use testutils::{descend, new_document_store};

#[test]
fn concurrent_add_of_same_node_conflicts() {
    let store = new_document_store(1);

    let session_a = Root::new(&store).unwrap();
    let session_b = Root::new(&store).unwrap();
    session_a.tree("/").add_child("a").unwrap();
    session_b.tree("/").add_child("b").unwrap();
    session_b.tree("/").add_child("a").unwrap();

    session_a.commit(&EmptyHook).unwrap();
    let err = session_b.commit(&EmptyHook).unwrap_err();
    assert_matches!(err, CommitError::Conflict(_));

    // The failed commit left nothing behind: /b does not exist and the
    // documents carry no trace of the rolled-back revision.
    let root = store.root().unwrap();
    assert!(descend(root.as_ref(), "/a").unwrap().exists());
    assert!(!descend(root.as_ref(), "/b").unwrap().exists());

    let doc_store = store.document_store();
    let a_doc = doc_store.find(Collection::Nodes, "1:/a").unwrap().unwrap();
    assert_eq!(a_doc.get_map(DELETED).unwrap().len(), 1);
    assert!(a_doc.get_map(COMMIT_ROOT).map_or(true, |m| m.is_empty()));
    if let Some(b_doc) = doc_store.find(Collection::Nodes, "1:/b").unwrap() {
        assert!(b_doc.get_map(DELETED).map_or(true, |m| m.is_empty()));
    }

    // A retry touching only the unrelated node succeeds.
    let session_b = Root::new(&store).unwrap();
    session_b.tree("/").add_child("b").unwrap();
    session_b.commit(&EmptyHook).unwrap();
    let root = store.root().unwrap();
    assert!(descend(root.as_ref(), "/a").unwrap().exists());
    assert!(descend(root.as_ref(), "/b").unwrap().exists());
}

#[test]
fn concurrent_property_write_conflicts() {
    let store = new_document_store(1);
    let setup = Root::new(&store).unwrap();
    setup
        .tree("/")
        .add_child("n")
        .unwrap()
        .set_property("p", PropertyValue::Long(0))
        .unwrap();
    setup.commit(&EmptyHook).unwrap();

    let session_a = Root::new(&store).unwrap();
    let session_b = Root::new(&store).unwrap();
    session_a
        .tree("/n")
        .set_property("p", PropertyValue::Long(1))
        .unwrap();
    session_b
        .tree("/n")
        .set_property("p", PropertyValue::Long(2))
        .unwrap();

    session_a.commit(&EmptyHook).unwrap();
    assert_matches!(
        session_b.commit(&EmptyHook).unwrap_err(),
        CommitError::Conflict(_)
    );

    let root = store.root().unwrap();
    let n = descend(root.as_ref(), "/n").unwrap();
    assert_eq!(
        n.property("p").unwrap().unwrap().value(),
        &PropertyValue::Long(1)
    );
}

#[test]
fn conflicting_delete_is_detected() {
    let store = new_document_store(1);
    let setup = Root::new(&store).unwrap();
    setup.tree("/").add_child("n").unwrap();
    setup.commit(&EmptyHook).unwrap();

    let deleter = Root::new(&store).unwrap();
    let writer = Root::new(&store).unwrap();
    assert!(deleter.tree("/n").remove().unwrap());
    writer
        .tree("/n")
        .set_property("p", PropertyValue::Long(1))
        .unwrap();

    deleter.commit(&EmptyHook).unwrap();
    assert_matches!(
        writer.commit(&EmptyHook).unwrap_err(),
        CommitError::Conflict(_)
    );
    assert!(!descend(store.root().unwrap().as_ref(), "/n")
        .unwrap()
        .exists());
}

#[test]
fn non_overlapping_commits_do_not_conflict() {
    let store = new_document_store(1);
    let session_a = Root::new(&store).unwrap();
    let session_b = Root::new(&store).unwrap();
    session_a.tree("/").add_child("a").unwrap();
    session_b.tree("/").add_child("b").unwrap();
    session_a.commit(&EmptyHook).unwrap();
    session_b.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    assert!(descend(root.as_ref(), "/a").unwrap().exists());
    assert!(descend(root.as_ref(), "/b").unwrap().exists());

    let doc_store = store.document_store();
    let b_doc = doc_store.find(Collection::Nodes, "1:/b").unwrap().unwrap();
    let node_doc = NodeDocument::new(b_doc).unwrap();
    assert_eq!(node_doc.path().as_str(), "/b");
}
