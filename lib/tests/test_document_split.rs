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

use canopy_lib::commit_hook::EmptyHook;
use canopy_lib::document::document::{NodeDocument, DELETED, REVISIONS};
use canopy_lib::document::store::{Collection, DocumentStore};
use canopy_lib::node::NodeState;
use canopy_lib::node_store::NodeStore;
use canopy_lib::path::NodePath;
use canopy_lib::property::PropertyValue;
use canopy_lib::root::Root;
use testutils::{descend, new_document_store};

#[test]
fn split_moves_old_revisions_to_previous_documents() {
    let store = new_document_store(1);
    let setup = Root::new(&store).unwrap();
    setup.tree("/").add_child("n").unwrap();
    setup.commit(&EmptyHook).unwrap();

    for i in 0..150 {
        let session = Root::new(&store).unwrap();
        session
            .tree("/n")
            .set_property("p", PropertyValue::Long(i))
            .unwrap();
        session.commit(&EmptyHook).unwrap();
    }
    let path = NodePath::from("/n");
    store.split_if_needed(&path).unwrap();

    let doc_store = store.document_store();
    let main = doc_store.find(Collection::Nodes, "1:/n").unwrap().unwrap();
    let node_doc = NodeDocument::new(main).unwrap();

    // The primary document was trimmed and points at a previous document.
    let ranges = node_doc.previous_ranges();
    assert!(!ranges.is_empty());
    let (high, low) = ranges[0];
    assert!(high.compare_time(&low) == std::cmp::Ordering::Greater);
    let prev_id = path.previous_document_id(&high);
    let prev = doc_store.find(Collection::Nodes, &prev_id).unwrap().unwrap();
    assert!(!prev.get_map("p").unwrap().is_empty());
    assert!(!prev.get_map(REVISIONS).unwrap().is_empty());

    let p_in_main = node_doc.document().get_map("p").unwrap().len();
    assert!(p_in_main < 150, "split must trim the primary: {p_in_main}");

    // The merged view still has all 150 revisions, newest first.
    let merged = node_doc.merged_map(doc_store.as_ref(), "p").unwrap();
    assert_eq!(merged.len(), 150);
    let newest = merged.keys().next_back().unwrap();
    for revision in merged.keys() {
        assert!(revision.compare_time(newest) != std::cmp::Ordering::Greater);
    }

    // Reads are unaffected by the split.
    let n = descend(store.root().unwrap().as_ref(), "/n").unwrap();
    assert_eq!(
        n.property("p").unwrap().unwrap().value(),
        &PropertyValue::Long(149)
    );
}

#[test]
fn split_never_moves_bookkeeping_keys() {
    let store = new_document_store(1);
    let setup = Root::new(&store).unwrap();
    setup.tree("/").add_child("n").unwrap();
    setup.commit(&EmptyHook).unwrap();
    for i in 0..120 {
        let session = Root::new(&store).unwrap();
        session
            .tree("/n")
            .set_property("p", PropertyValue::Long(i))
            .unwrap();
        session.commit(&EmptyHook).unwrap();
    }
    let path = NodePath::from("/n");
    store.split_if_needed(&path).unwrap();

    let doc_store = store.document_store();
    let main = doc_store.find(Collection::Nodes, "1:/n").unwrap().unwrap();
    let node_doc = NodeDocument::new(main).unwrap();
    let (high, _) = node_doc.previous_ranges()[0];
    let prev_id = path.previous_document_id(&high);
    let prev = doc_store.find(Collection::Nodes, &prev_id).unwrap().unwrap();

    // `_modCount`, `_modified`, `_lastRev` and `_prev` stay in the primary.
    for key in ["_modCount", "_modified", "_lastRev", "_prev"] {
        assert!(prev.get(key).is_none(), "{key} must not be split off");
    }
    // The newest revision of each map stays in the primary document.
    let main_doc = node_doc.document();
    let newest_in_main = main_doc.get_map("p").unwrap().keys().next_back().copied();
    let newest_in_prev = prev.get_map("p").unwrap().keys().next_back().copied();
    assert!(newest_in_main.unwrap().compare_time(&newest_in_prev.unwrap())
        == std::cmp::Ordering::Greater);
    // The delete marker of the node creation never left the primary.
    assert!(main_doc.get_map(DELETED).is_some());
    assert!(prev.get_map(DELETED).is_none());
}

#[test]
fn small_documents_are_not_split() {
    let store = new_document_store(1);
    let setup = Root::new(&store).unwrap();
    setup
        .tree("/")
        .add_child("small")
        .unwrap()
        .set_property("p", PropertyValue::Long(1))
        .unwrap();
    setup.commit(&EmptyHook).unwrap();

    let path = NodePath::from("/small");
    store.split_if_needed(&path).unwrap();
    let doc_store = store.document_store();
    let doc = doc_store
        .find(Collection::Nodes, "1:/small")
        .unwrap()
        .unwrap();
    let node_doc = NodeDocument::new(doc).unwrap();
    assert!(node_doc.previous_ranges().is_empty());
}
