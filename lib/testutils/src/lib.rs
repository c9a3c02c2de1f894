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

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use canopy_lib::document::node_store::DocumentNodeStore;
use canopy_lib::document::store::MemoryDocumentStore;
use canopy_lib::node::{NodeState, StoreResult};
use canopy_lib::node_store::NodeStore;
use canopy_lib::revision::Clock;
use canopy_lib::segment::file_store::FileSegmentStore;
use canopy_lib::segment::node_store::SegmentNodeStore;
use canopy_lib::segment::store::MemorySegmentStore;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("canopy-test-")
        .tempdir()
        .unwrap()
}

/// Deterministic wall clock for tests; starts at an arbitrary fixed time.
pub struct FakeClock {
    millis: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Arc<FakeClock> {
        Arc::new(FakeClock {
            millis: AtomicU64::new(1_000_000),
        })
    }

    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum TestBackend {
    Document,
    Segment,
    SegmentFile,
}

/// A node store fixture over one of the backends, plus the temp dir that
/// keeps a file-backed store alive.
pub struct TestNodeStore {
    _temp_dir: Option<TempDir>,
    pub clock: Arc<FakeClock>,
    pub store: Box<dyn NodeStore>,
}

impl TestNodeStore {
    pub fn init(backend: TestBackend) -> TestNodeStore {
        let clock = FakeClock::new();
        match backend {
            TestBackend::Document => TestNodeStore {
                _temp_dir: None,
                store: Box::new(new_document_store_with_clock(1, clock.clone())),
                clock,
            },
            TestBackend::Segment => TestNodeStore {
                _temp_dir: None,
                store: Box::new(new_segment_store_with_clock(clock.clone())),
                clock,
            },
            TestBackend::SegmentFile => {
                let temp_dir = new_temp_dir();
                let file_store =
                    FileSegmentStore::open(temp_dir.path().join("segments")).unwrap();
                let store = SegmentNodeStore::with_options(
                    Arc::new(file_store),
                    64 * 1024 * 1024,
                    clock.clone(),
                )
                .unwrap();
                TestNodeStore {
                    _temp_dir: Some(temp_dir),
                    store: Box::new(store),
                    clock,
                }
            }
        }
    }

    pub fn store(&self) -> &dyn NodeStore {
        self.store.as_ref()
    }
}

pub fn new_document_store(cluster_id: u32) -> DocumentNodeStore {
    new_document_store_with_clock(cluster_id, FakeClock::new())
}

pub fn new_document_store_with_clock(
    cluster_id: u32,
    clock: Arc<FakeClock>,
) -> DocumentNodeStore {
    DocumentNodeStore::with_clock(Arc::new(MemoryDocumentStore::new()), cluster_id, clock)
        .unwrap()
}

pub fn new_segment_store() -> SegmentNodeStore {
    new_segment_store_with_clock(FakeClock::new())
}

pub fn new_segment_store_with_clock(clock: Arc<FakeClock>) -> SegmentNodeStore {
    SegmentNodeStore::with_options(Arc::new(MemorySegmentStore::new()), 64 * 1024 * 1024, clock)
        .unwrap()
}

/// Resolves a descendant of `state` by slash-separated path.
pub fn descend(state: &dyn NodeState, path: &str) -> StoreResult<Arc<dyn NodeState>> {
    let mut current: Option<Arc<dyn NodeState>> = None;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current = Some(match &current {
            None => state.child(component)?,
            Some(node) => node.child(component)?,
        });
    }
    Ok(current.expect("path must have at least one component"))
}

/// Checks that every `test_*.rs` file next to the runner is declared as a
/// module, so no test file is silently skipped.
pub fn assert_no_forgotten_test_files(test_dir: &Path) {
    let runner = std::fs::read_to_string(test_dir.join("runner.rs")).unwrap();
    for entry in std::fs::read_dir(test_dir).unwrap() {
        let name = entry.unwrap().file_name();
        let name = name.to_str().unwrap();
        if let Some(stem) = name.strip_suffix(".rs") {
            if stem == "runner" {
                continue;
            }
            assert!(
                runner.contains(&format!("mod {stem};")),
                "test file {name} is not declared in runner.rs"
            );
        }
    }
}
