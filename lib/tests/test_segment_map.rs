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

use std::collections::BTreeMap;
use std::sync::Arc;

use canopy_lib::node::StoreResult;
use canopy_lib::segment::cache::SegmentCache;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use canopy_lib::segment::id::{RecordId, SegmentIdFactory};
use canopy_lib::segment::map_record::{self, map_hash, MapDiffVisitor, MapRecord};
use canopy_lib::segment::reader::SegmentReader;
use canopy_lib::segment::store::MemorySegmentStore;
use canopy_lib::segment::writer::SegmentWriter;

struct Fixture {
    reader: Arc<SegmentReader>,
    writer: SegmentWriter,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemorySegmentStore::new());
    let factory = Arc::new(SegmentIdFactory::new());
    let cache = Arc::new(SegmentCache::new(16 * 1024 * 1024));
    let reader = Arc::new(SegmentReader::new(store.clone(), cache, factory.clone()));
    let writer = SegmentWriter::new(store, reader.clone(), factory);
    Fixture { reader, writer }
}

fn build_map(fixture: &Fixture, entries: &BTreeMap<String, String>) -> MapRecord {
    let mut ids = BTreeMap::new();
    for (key, value) in entries {
        ids.insert(key.clone(), fixture.writer.write_string(value).unwrap());
    }
    let map_id = fixture.writer.write_map(&ids).unwrap();
    fixture.writer.flush().unwrap();
    MapRecord::open(fixture.reader.clone(), map_id).unwrap()
}

#[derive(Default)]
struct RecordingVisitor {
    events: Vec<String>,
    stop_after: Option<usize>,
}

impl RecordingVisitor {
    fn proceed(&self) -> bool {
        self.stop_after.map_or(true, |n| self.events.len() < n)
    }
}

impl MapDiffVisitor for RecordingVisitor {
    fn entry_added(&mut self, key: &str, _after: &RecordId) -> StoreResult<bool> {
        self.events.push(format!("added:{key}"));
        Ok(self.proceed())
    }

    fn entry_changed(
        &mut self,
        key: &str,
        _before: &RecordId,
        _after: &RecordId,
    ) -> StoreResult<bool> {
        self.events.push(format!("changed:{key}"));
        Ok(self.proceed())
    }

    fn entry_deleted(&mut self, key: &str, _before: &RecordId) -> StoreResult<bool> {
        self.events.push(format!("deleted:{key}"));
        Ok(self.proceed())
    }
}

#[test]
fn get_finds_every_inserted_key() {
    let fixture = fixture();
    let mut entries = BTreeMap::new();
    for i in 0..1000 {
        entries.insert(format!("key-{i}"), format!("value-{i}"));
    }
    let map = build_map(&fixture, &entries);
    assert_eq!(map.size(), 1000);
    assert!(!map.is_leaf());

    for (key, value) in &entries {
        let value_id = map.get(key).unwrap().unwrap_or_else(|| {
            panic!("{key} not found");
        });
        assert_eq!(&*fixture.reader.read_string(&value_id).unwrap(), value);
    }
    assert_eq!(map.get("key-1000").unwrap(), None);
    assert_eq!(map.get("").unwrap(), None);

    let mut keys = map.keys().unwrap();
    keys.sort();
    assert_eq!(keys.len(), 1000);
    assert_eq!(keys, entries.keys().cloned().collect::<Vec<_>>());
}

#[test]
fn small_maps_are_leaves() {
    let fixture = fixture();
    let mut entries = BTreeMap::new();
    for i in 0..32 {
        entries.insert(format!("k{i}"), "v".to_string());
    }
    let map = build_map(&fixture, &entries);
    assert!(map.is_leaf());
    assert_eq!(map.size(), 32);
    assert_eq!(map.level(), 0);

    let mut entries = entries;
    entries.insert("k32".to_string(), "v".to_string());
    let map = build_map(&fixture, &entries);
    assert!(!map.is_leaf());
    assert_eq!(map.size(), 33);
}

#[test]
fn empty_map_round_trips() {
    let fixture = fixture();
    let map = build_map(&fixture, &BTreeMap::new());
    assert_eq!(map.size(), 0);
    assert!(map.is_leaf());
    assert_eq!(map.get("anything").unwrap(), None);
    assert!(map.entries().unwrap().is_empty());
}

#[test]
fn diff_against_empty_reports_every_entry_added() {
    let fixture = fixture();
    let empty = build_map(&fixture, &BTreeMap::new());
    let mut entries = BTreeMap::new();
    for i in 0..100 {
        entries.insert(format!("k{i}"), format!("v{i}"));
    }
    let full = build_map(&fixture, &entries);

    let mut visitor = RecordingVisitor::default();
    assert!(map_record::diff(&empty, &full, &mut visitor).unwrap());
    assert_eq!(visitor.events.len(), 100);
    assert!(visitor.events.iter().all(|e| e.starts_with("added:")));
}

#[test]
fn diff_reports_changes_in_hash_order() {
    let fixture = fixture();
    let before = build_map(
        &fixture,
        &btreemap! {
            "k1".to_string() => "v1".to_string(),
            "k2".to_string() => "v2".to_string(),
        },
    );
    let after = build_map(
        &fixture,
        &btreemap! {
            "k1".to_string() => "v1".to_string(),
            "k2".to_string() => "v3".to_string(),
            "k3".to_string() => "v4".to_string(),
        },
    );

    let mut visitor = RecordingVisitor::default();
    assert!(map_record::diff(&before, &after, &mut visitor).unwrap());

    let mut expected = vec![
        (map_hash("k2"), "changed:k2".to_string()),
        (map_hash("k3"), "added:k3".to_string()),
    ];
    expected.sort();
    let expected: Vec<String> = expected.into_iter().map(|(_, e)| e).collect();
    assert_eq!(visitor.events, expected);
}

#[test]
fn diff_skips_identical_maps_and_unchanged_buckets() {
    let fixture = fixture();
    let mut entries = BTreeMap::new();
    for i in 0..200 {
        entries.insert(format!("k{i}"), "same".to_string());
    }
    let a = build_map(&fixture, &entries);
    let b = MapRecord::open(fixture.reader.clone(), a.id().clone()).unwrap();
    let mut visitor = RecordingVisitor::default();
    assert!(map_record::diff(&a, &b, &mut visitor).unwrap());
    assert!(visitor.events.is_empty());

    // One entry changes in a 200-entry branch map.
    entries.insert("k7".to_string(), "different".to_string());
    let c = build_map(&fixture, &entries);
    let mut visitor = RecordingVisitor::default();
    assert!(map_record::diff(&a, &c, &mut visitor).unwrap());
    assert_eq!(visitor.events, vec!["changed:k7".to_string()]);
}

#[test]
fn diff_aborts_when_the_visitor_returns_false() {
    let fixture = fixture();
    let empty = build_map(&fixture, &BTreeMap::new());
    let mut entries = BTreeMap::new();
    for i in 0..50 {
        entries.insert(format!("k{i}"), "v".to_string());
    }
    let full = build_map(&fixture, &entries);

    let mut visitor = RecordingVisitor {
        events: vec![],
        stop_after: Some(1),
    };
    assert!(!map_record::diff(&empty, &full, &mut visitor).unwrap());
    assert_eq!(visitor.events.len(), 1);
}

#[test]
fn deletions_are_reported() {
    let fixture = fixture();
    let before = build_map(
        &fixture,
        &btreemap! {
            "gone".to_string() => "v".to_string(),
            "kept".to_string() => "v".to_string(),
        },
    );
    let after = build_map(&fixture, &btreemap! { "kept".to_string() => "v".to_string() });
    let mut visitor = RecordingVisitor::default();
    assert!(map_record::diff(&before, &after, &mut visitor).unwrap());
    assert_eq!(visitor.events, vec!["deleted:gone".to_string()]);
}
