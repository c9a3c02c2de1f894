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

use std::thread;

use canopy_lib::commit_hook::EmptyHook;
use canopy_lib::node::NodeState;
use canopy_lib::node_store::NodeStore;
use canopy_lib::root::Root;
use test_case::test_case;
use testutils::{TestBackend, TestNodeStore};

/// Commits one child per thread; all children must be present afterwards.
/// Losing a journal or conflict race is fine as long as a retry lands.
#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn parallel_commits_all_land(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();
    let threads = 8;

    thread::scope(|scope| {
        for i in 0..threads {
            scope.spawn(move || {
                let name = format!("t{i}");
                loop {
                    let session = Root::new(store).unwrap();
                    session.tree("/").add_child(&name).unwrap();
                    if session.commit(&EmptyHook).is_ok() {
                        break;
                    }
                }
            });
        }
    });

    let root = store.root().unwrap();
    let names = root.child_names().unwrap();
    assert_eq!(names.len(), threads, "children: {names:?}");
    for i in 0..threads {
        assert!(names.contains(&format!("t{i}")));
    }
}

#[test_case(TestBackend::Document ; "document")]
#[test_case(TestBackend::Segment ; "segment")]
fn snapshot_isolation_under_concurrent_writes(backend: TestBackend) {
    let fixture = TestNodeStore::init(backend);
    let store = fixture.store();

    let setup = Root::new(store).unwrap();
    setup.tree("/").add_child("base").unwrap();
    setup.commit(&EmptyHook).unwrap();
    let snapshot = store.root().unwrap();

    thread::scope(|scope| {
        for i in 0..4 {
            scope.spawn(move || {
                let name = format!("w{i}");
                loop {
                    let session = Root::new(store).unwrap();
                    session.tree("/").add_child(&name).unwrap();
                    if session.commit(&EmptyHook).is_ok() {
                        break;
                    }
                }
            });
        }
        // The snapshot taken before the writers started never changes.
        for _ in 0..10 {
            assert_eq!(snapshot.child_names().unwrap(), vec!["base"]);
        }
    });
    assert_eq!(snapshot.child_names().unwrap(), vec!["base"]);
    assert_eq!(store.root().unwrap().child_names().unwrap().len(), 5);
}
