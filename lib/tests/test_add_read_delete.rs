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

use canopy_lib::blob::Blob;
use canopy_lib::commit_hook::EmptyHook;
use canopy_lib::node::NodeState;
use canopy_lib::node_store::NodeStore;
use canopy_lib::property::{PropertyState, PropertyValue};
use canopy_lib::root::Root;
use test_case::test_case;
use testutils::{descend, TestBackend, TestNodeStore};

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
#[test_case(TestBackend::SegmentFile ; "segment file")]
fn add_read_delete(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();
    let r0 = store.root().unwrap();
    assert!(!descend(r0.as_ref(), "/test").unwrap().exists());

    let session = Root::new(store).unwrap();
    session.tree("/").add_child("test").unwrap();
    session.commit(&EmptyHook).unwrap();
    let r1 = store.root().unwrap();
    let test_at_r1 = descend(r1.as_ref(), "/test").unwrap();
    assert!(test_at_r1.exists());
    assert!(test_at_r1.child_names().unwrap().is_empty());

    let session = Root::new(store).unwrap();
    assert!(session.tree("/test").remove().unwrap());
    session.commit(&EmptyHook).unwrap();
    let r2 = store.root().unwrap();

    // Earlier snapshots are unaffected by the later delete.
    assert!(!descend(r0.as_ref(), "/test").unwrap().exists());
    assert!(descend(r1.as_ref(), "/test").unwrap().exists());
    assert!(!descend(r2.as_ref(), "/test").unwrap().exists());
    // Children of a deleted node are gone with it.
    assert!(!descend(r2.as_ref(), "/test/anything").unwrap().exists());
}

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn properties_survive_commit(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();

    let session = Root::new(store).unwrap();
    let node = session.tree("/").add_child("node").unwrap();
    node.set_property("title", PropertyValue::String("hello".to_string()))
        .unwrap();
    node.set_property("count", PropertyValue::Long(-3)).unwrap();
    node.set_property("flag", PropertyValue::Boolean(true)).unwrap();
    node.set_property(
        "tags",
        PropertyValue::Strings(vec!["a".to_string(), "b".to_string()]),
    )
    .unwrap();
    session.commit(&EmptyHook).unwrap();

    let node = descend(store.root().unwrap().as_ref(), "/node").unwrap();
    assert_eq!(
        node.property("title").unwrap(),
        Some(PropertyState::string("title", "hello"))
    );
    assert_eq!(
        node.property("count").unwrap(),
        Some(PropertyState::long("count", -3))
    );
    assert_eq!(
        node.property("flag").unwrap(),
        Some(PropertyState::boolean("flag", true))
    );
    assert_eq!(
        node.property("tags").unwrap(),
        Some(PropertyState::strings("tags", ["a", "b"]))
    );
    assert_eq!(node.property("missing").unwrap(), None);
    assert_eq!(node.properties().unwrap().len(), 4);

    // Overwrite and remove.
    let session = Root::new(store).unwrap();
    let tree = session.tree("/node");
    tree.set_property("count", PropertyValue::Long(7)).unwrap();
    tree.remove_property("flag").unwrap();
    session.commit(&EmptyHook).unwrap();

    let node = descend(store.root().unwrap().as_ref(), "/node").unwrap();
    assert_eq!(
        node.property("count").unwrap(),
        Some(PropertyState::long("count", 7))
    );
    assert_eq!(node.property("flag").unwrap(), None);
}

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn nested_trees_commit_and_read(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();

    let session = Root::new(store).unwrap();
    let a = session.tree("/").add_child("a").unwrap();
    let b = a.add_child("b").unwrap();
    b.add_child("c").unwrap();
    a.add_child("d").unwrap();
    session.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    let a = descend(root.as_ref(), "/a").unwrap();
    assert_eq!(a.child_names().unwrap(), vec!["b", "d"]);
    assert!(descend(root.as_ref(), "/a/b/c").unwrap().exists());

    // Removing an inner node removes the whole subtree.
    let session = Root::new(store).unwrap();
    assert!(session.tree("/a/b").remove().unwrap());
    session.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    assert_eq!(
        descend(root.as_ref(), "/a").unwrap().child_names().unwrap(),
        vec!["d"]
    );
    assert!(!descend(root.as_ref(), "/a/b/c").unwrap().exists());
}

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn blobs_round_trip(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();
    let blob = store.create_blob(&mut b"binary content".as_slice()).unwrap();
    assert_eq!(blob.length(), 14);
    assert_eq!(blob.read_bytes().unwrap(), b"binary content");
    assert!(!blob.reference().is_empty());
}
