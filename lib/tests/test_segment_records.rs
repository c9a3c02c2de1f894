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
use canopy_lib::node::{node_states_equal, NodeState};
use canopy_lib::node_store::NodeStore;
use canopy_lib::property::{PropertyState, PropertyValue};
use canopy_lib::root::Root;
use canopy_lib::segment::node_state::SegmentNodeState;
use canopy_lib::segment::node_store::SegmentNodeStore;
use canopy_lib::segment::segment::RecordType;
use canopy_lib::segment::store::{MemorySegmentStore, SegmentStore};
use testutils::{descend, new_segment_store_with_clock, FakeClock};

fn store_pair() -> (Arc<MemorySegmentStore>, SegmentNodeStore) {
    let raw = Arc::new(MemorySegmentStore::new());
    let store = SegmentNodeStore::with_options(
        raw.clone(),
        64 * 1024 * 1024,
        FakeClock::new(),
    )
    .unwrap();
    (raw, store)
}

#[test]
fn roots_of_written_segments_read_back() {
    let (raw, store) = store_pair();
    let session = Root::new(&store).unwrap();
    let node = session.tree("/").add_child("content").unwrap();
    node.set_property("text", PropertyValue::String("payload".to_string()))
        .unwrap();
    node.add_child("inner").unwrap();
    session.commit(&EmptyHook).unwrap();

    let mut node_roots = 0;
    for (msb, lsb) in raw.segment_ids().unwrap() {
        let id = store.factory().get_segment_id(msb, lsb);
        if !id.is_data_segment_id() {
            continue;
        }
        let segment = store.reader().segment(&id).unwrap();
        for (record_type, offset) in segment.roots() {
            if *record_type != RecordType::Node {
                continue;
            }
            node_roots += 1;
            let record_id =
                canopy_lib::segment::id::RecordId::new(id.clone(), *offset);
            let state = SegmentNodeState::new(store.reader().clone(), record_id);
            // Every node root decodes: template, properties and children.
            state.template().unwrap();
            state.properties().unwrap();
            for name in state.child_names().unwrap() {
                assert!(state.child(&name).unwrap().exists());
            }
        }
    }
    assert!(node_roots > 0, "the head node must be a root record");
}

#[test]
fn a_second_store_instance_reads_the_same_tree() {
    let (raw, store) = store_pair();
    let session = Root::new(&store).unwrap();
    let node = session.tree("/").add_child("shared").unwrap();
    node.set_property("n", PropertyValue::Long(42)).unwrap();
    session.commit(&EmptyHook).unwrap();
    let original_root = store.root().unwrap();

    let reopened = SegmentNodeStore::with_options(
        raw,
        64 * 1024 * 1024,
        FakeClock::new(),
    )
    .unwrap();
    let reopened_root = reopened.root().unwrap();
    assert!(node_states_equal(original_root.as_ref(), reopened_root.as_ref()).unwrap());
}

#[test]
fn long_strings_span_bulk_segments() {
    let (raw, store) = store_pair();
    let long_value: String = "abcdefgh".repeat(5000); // 40000 chars
    let session = Root::new(&store).unwrap();
    session
        .tree("/")
        .add_child("big")
        .unwrap()
        .set_property("text", PropertyValue::String(long_value.clone()))
        .unwrap();
    session.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    let big = descend(root.as_ref(), "/big").unwrap();
    assert_eq!(
        big.property("text").unwrap(),
        Some(PropertyState::string("text", long_value))
    );
    // The value went through at least one bulk segment.
    let has_bulk = raw
        .segment_ids()
        .unwrap()
        .into_iter()
        .any(|(msb, lsb)| store.factory().get_segment_id(msb, lsb).is_bulk_segment_id());
    assert!(has_bulk);
}

#[test]
fn large_multi_values_round_trip() {
    let (_raw, store) = store_pair();
    let values: Vec<String> = (0..300).map(|i| format!("value-{i}")).collect();
    let session = Root::new(&store).unwrap();
    session
        .tree("/")
        .add_child("multi")
        .unwrap()
        .set_property("all", PropertyValue::Strings(values.clone()))
        .unwrap();
    session.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    let multi = descend(root.as_ref(), "/multi").unwrap();
    assert_eq!(
        multi.property("all").unwrap().unwrap().value(),
        &PropertyValue::Strings(values)
    );
}

#[test]
fn identical_shapes_share_a_template() {
    let (_raw, store) = store_pair();
    let session = Root::new(&store).unwrap();
    for name in ["a", "b"] {
        session
            .tree("/")
            .add_child(name)
            .unwrap()
            .set_property("p", PropertyValue::Long(1))
            .unwrap();
    }
    session.commit(&EmptyHook).unwrap();

    let root = store.root().unwrap();
    let a = descend(root.as_ref(), "/a").unwrap();
    let b = descend(root.as_ref(), "/b").unwrap();
    let a = a.as_any().downcast_ref::<SegmentNodeState>().unwrap();
    let b = b.as_any().downcast_ref::<SegmentNodeState>().unwrap();
    // Same shape, same cached template instance.
    let ta = a.template().unwrap();
    let tb = b.template().unwrap();
    assert!(Arc::ptr_eq(&ta, &tb));
    assert_ne!(a.record_id(), b.record_id());
}

#[test]
fn segment_diff_short_circuits_on_record_ids() {
    use canopy_lib::node::{NodeStateDiff, StoreResult};
    use canopy_lib::segment::node_state::compare_segment_node_states;

    #[derive(Default)]
    struct Events(Vec<String>);

    impl NodeStateDiff for Events {
        fn child_node_added(
            &mut self,
            name: &str,
            _after: &dyn NodeState,
        ) -> StoreResult<bool> {
            self.0.push(format!("added:{name}"));
            Ok(true)
        }

        fn child_node_changed(
            &mut self,
            name: &str,
            _before: &dyn NodeState,
            _after: &dyn NodeState,
        ) -> StoreResult<bool> {
            self.0.push(format!("changed:{name}"));
            Ok(true)
        }

        fn child_node_deleted(
            &mut self,
            name: &str,
            _before: &dyn NodeState,
        ) -> StoreResult<bool> {
            self.0.push(format!("deleted:{name}"));
            Ok(true)
        }
    }

    let (_raw, store) = store_pair();
    let session = Root::new(&store).unwrap();
    for name in ["a", "b", "c"] {
        session.tree("/").add_child(name).unwrap();
    }
    session.commit(&EmptyHook).unwrap();
    let before = store.root().unwrap();

    let session = Root::new(&store).unwrap();
    session.tree("/").add_child("d").unwrap();
    session
        .tree("/b")
        .set_property("p", PropertyValue::Long(1))
        .unwrap();
    session.commit(&EmptyHook).unwrap();
    let after = store.root().unwrap();

    let before = before.as_any().downcast_ref::<SegmentNodeState>().unwrap();
    let after = after.as_any().downcast_ref::<SegmentNodeState>().unwrap();
    let mut events = Events::default();
    assert!(compare_segment_node_states(before, after, &mut events).unwrap());
    events.0.sort();
    assert_eq!(events.0, vec!["added:d", "changed:b"]);

    // Identical states report nothing.
    let mut events = Events::default();
    assert!(compare_segment_node_states(after, after, &mut events).unwrap());
    assert!(events.0.is_empty());
}

#[test]
fn unchanged_subtrees_keep_their_records() {
    let (_raw, store) = store_pair();
    let session = Root::new(&store).unwrap();
    session.tree("/").add_child("stable").unwrap();
    session.tree("/").add_child("volatile").unwrap();
    session.commit(&EmptyHook).unwrap();

    let before = descend(store.root().unwrap().as_ref(), "/stable").unwrap();
    let before_id = before
        .as_any()
        .downcast_ref::<SegmentNodeState>()
        .unwrap()
        .record_id()
        .clone();

    let session = Root::new(&store).unwrap();
    session
        .tree("/volatile")
        .set_property("v", PropertyValue::Long(1))
        .unwrap();
    session.commit(&EmptyHook).unwrap();

    let after = descend(store.root().unwrap().as_ref(), "/stable").unwrap();
    let after_id = after
        .as_any()
        .downcast_ref::<SegmentNodeState>()
        .unwrap()
        .record_id()
        .clone();
    assert_eq!(before_id, after_id);
}
