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
use canopy_lib::node::NodeState;
use canopy_lib::node_store::NodeStore;
use canopy_lib::property::PropertyValue;
use canopy_lib::root::Root;
use test_case::test_case;
use testutils::{descend, TestBackend, TestNodeStore};

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn move_is_session_local_until_commit(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();

    let setup = Root::new(store).unwrap();
    let x = setup.tree("/").add_child("x").unwrap();
    x.set_property("p", PropertyValue::Long(11)).unwrap();
    setup.commit(&EmptyHook).unwrap();

    let session1 = Root::new(store).unwrap();
    let session2 = Root::new(store).unwrap();

    assert!(session1.move_node("/x", "/y").unwrap());
    // Session 1 sees the move.
    assert!(session1.tree("/y").exists().unwrap());
    assert!(!session1.tree("/x").exists().unwrap());
    // Session 2 does not.
    assert!(session2.tree("/x").exists().unwrap());
    assert!(!session2.tree("/y").exists().unwrap());

    session1.commit(&EmptyHook).unwrap();
    // Session 2 still reads its snapshot until it refreshes.
    assert!(session2.tree("/x").exists().unwrap());
    session2.rebase().unwrap();
    assert!(session2.tree("/y").exists().unwrap());
    assert!(!session2.tree("/x").exists().unwrap());

    // The moved node kept its content.
    let y = descend(store.root().unwrap().as_ref(), "/y").unwrap();
    assert_eq!(
        y.property("p").unwrap().unwrap().value(),
        &PropertyValue::Long(11)
    );
}

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn move_carries_pending_changes(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();

    let setup = Root::new(store).unwrap();
    setup.tree("/").add_child("src").unwrap();
    setup.tree("/").add_child("dst").unwrap();
    setup.commit(&EmptyHook).unwrap();

    let session = Root::new(store).unwrap();
    // Modify, then move: the edit travels with the subtree.
    session
        .tree("/src")
        .set_property("edited", PropertyValue::Boolean(true))
        .unwrap();
    assert!(session.move_node("/src", "/dst/moved").unwrap());
    session.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    assert!(!descend(root.as_ref(), "/src").unwrap().exists());
    let moved = descend(root.as_ref(), "/dst/moved").unwrap();
    assert!(moved.exists());
    assert_eq!(
        moved.property("edited").unwrap().unwrap().value(),
        &PropertyValue::Boolean(true)
    );
}

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn tree_handles_follow_later_moves(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();

    let setup = Root::new(store).unwrap();
    let a = setup.tree("/").add_child("a").unwrap();
    a.add_child("leaf").unwrap();
    setup.commit(&EmptyHook).unwrap();

    let session = Root::new(store).unwrap();
    let leaf = session.tree("/a/leaf");
    assert!(session.move_node("/a", "/b").unwrap());
    // The handle created before the move resolves through the move chain.
    assert_eq!(leaf.path().as_str(), "/b/leaf");
    leaf.set_property("q", PropertyValue::Long(1)).unwrap();
    session.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    let leaf = descend(root.as_ref(), "/b/leaf").unwrap();
    assert_eq!(
        leaf.property("q").unwrap().unwrap().value(),
        &PropertyValue::Long(1)
    );
}
