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

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, RwLock};

use crate::node::StoreResult;
use crate::segment::id::SegmentId;

/// The single compare-and-swap'd slot holding the repository head. The head
/// is a serialized record id; `None` means the store is uninitialized.
pub trait Journal: Send + Sync + Debug {
    fn head(&self) -> StoreResult<Option<String>>;

    /// Advances the head from `base` to `head`. Succeeds iff the current
    /// value equals `base`; exactly one of any set of concurrent callers
    /// with the same `base` wins.
    fn set_head(&self, base: Option<&str>, head: &str) -> StoreResult<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryJournal {
    head: Mutex<Option<String>>,
}

impl Journal for MemoryJournal {
    fn head(&self) -> StoreResult<Option<String>> {
        Ok(self.head.lock().unwrap().clone())
    }

    fn set_head(&self, base: Option<&str>, head: &str) -> StoreResult<bool> {
        let mut slot = self.head.lock().unwrap();
        if slot.as_deref() != base {
            return Ok(false);
        }
        *slot = Some(head.to_string());
        Ok(true)
    }
}

/// Raw segment persistence. Segments are immutable once written.
pub trait SegmentStore: Send + Sync + Debug {
    fn contains_segment(&self, id: &SegmentId) -> StoreResult<bool>;

    fn read_segment(&self, id: &SegmentId) -> StoreResult<Option<Vec<u8>>>;

    fn write_segment(&self, id: &SegmentId, data: &[u8]) -> StoreResult<()>;

    /// IDs of all stored segments; used by the garbage collector.
    fn segment_ids(&self) -> StoreResult<Vec<(u64, u64)>>;

    fn remove_segment(&self, id: &SegmentId) -> StoreResult<()>;

    fn journal(&self) -> &dyn Journal;
}

#[derive(Debug, Default)]
pub struct MemorySegmentStore {
    segments: RwLock<HashMap<(u64, u64), Vec<u8>>>,
    journal: MemoryJournal,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        MemorySegmentStore::default()
    }
}

impl SegmentStore for MemorySegmentStore {
    fn contains_segment(&self, id: &SegmentId) -> StoreResult<bool> {
        Ok(self
            .segments
            .read()
            .unwrap()
            .contains_key(&(id.msb(), id.lsb())))
    }

    fn read_segment(&self, id: &SegmentId) -> StoreResult<Option<Vec<u8>>> {
        Ok(self
            .segments
            .read()
            .unwrap()
            .get(&(id.msb(), id.lsb()))
            .cloned())
    }

    fn write_segment(&self, id: &SegmentId, data: &[u8]) -> StoreResult<()> {
        self.segments
            .write()
            .unwrap()
            .insert((id.msb(), id.lsb()), data.to_vec());
        Ok(())
    }

    fn segment_ids(&self) -> StoreResult<Vec<(u64, u64)>> {
        Ok(self.segments.read().unwrap().keys().copied().collect())
    }

    fn remove_segment(&self, id: &SegmentId) -> StoreResult<()> {
        self.segments.write().unwrap().remove(&(id.msb(), id.lsb()));
        Ok(())
    }

    fn journal(&self) -> &dyn Journal {
        &self.journal
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn journal_cas_requires_matching_base() {
        let journal = MemoryJournal::default();
        assert_eq!(journal.head().unwrap(), None);
        assert!(journal.set_head(None, "a").unwrap());
        assert!(!journal.set_head(None, "b").unwrap());
        assert!(journal.set_head(Some("a"), "b").unwrap());
        assert_eq!(journal.head().unwrap(), Some("b".to_string()));
    }

    #[test]
    fn journal_cas_is_exclusive_under_contention() {
        let store = Arc::new(MemorySegmentStore::new());
        store.journal().set_head(None, "base").unwrap();
        let mut handles = vec![];
        for i in 0..16 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                store
                    .journal()
                    .set_head(Some("base"), &format!("head-{i}"))
                    .unwrap()
            }));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1);
    }
}
