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

use std::collections::HashSet;
use std::collections::hash_map::RandomState;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};

use clru::{CLruCache, CLruCacheConfig, WeightScale};

use crate::node::StoreResult;
use crate::segment::id::SegmentId;
use crate::segment::segment::Segment;

/// Default cache budget: 256 MiB of segment data.
pub const DEFAULT_SEGMENT_CACHE_BYTES: usize = 256 * 1024 * 1024;

type Key = (u64, u64);

struct SegmentWeightScale;

impl WeightScale<Key, Arc<Segment>> for SegmentWeightScale {
    fn weight(&self, _key: &Key, value: &Arc<Segment>) -> usize {
        value.size()
    }
}

struct CacheInner {
    lru: CLruCache<Key, Arc<Segment>, RandomState, SegmentWeightScale>,
    loading: HashSet<Key>,
}

/// Byte-bounded LRU of loaded segments with single-flight loading:
/// concurrent requests for the same segment wait for the one loader instead
/// of fetching the segment twice.
pub struct SegmentCache {
    inner: Mutex<CacheInner>,
    loaded: Condvar,
}

impl Debug for SegmentCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentCache").finish_non_exhaustive()
    }
}

impl SegmentCache {
    pub fn new(max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_bytes.max(1)).unwrap();
        SegmentCache {
            inner: Mutex::new(CacheInner {
                lru: CLruCache::with_config(
                    CLruCacheConfig::new(capacity).with_scale(SegmentWeightScale),
                ),
                loading: HashSet::new(),
            }),
            loaded: Condvar::new(),
        }
    }

    /// The cached segment for `id`, or the result of `load`, which runs at
    /// most once per id at any moment; other callers wait for it.
    pub fn get_or_load(
        &self,
        id: &Arc<SegmentId>,
        load: impl FnOnce() -> StoreResult<Arc<Segment>>,
    ) -> StoreResult<Arc<Segment>> {
        let key = (id.msb(), id.lsb());
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(segment) = inner.lru.get(&key) {
                return Ok(segment.clone());
            }
            if !inner.loading.contains(&key) {
                break;
            }
            inner = self.loaded.wait(inner).unwrap();
        }
        inner.loading.insert(key);
        drop(inner);

        let result = load();

        let mut inner = self.inner.lock().unwrap();
        inner.loading.remove(&key);
        if let Ok(segment) = &result {
            // Over-budget inserts evict from the LRU tail; a segment larger
            // than the whole budget is simply not cached.
            let _ = inner.lru.put_with_weight(key, segment.clone());
        }
        drop(inner);
        self.loaded.notify_all();
        result
    }

    pub fn contains(&self, id: &SegmentId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.get(&(id.msb(), id.lsb())).is_some()
    }

    /// The sum of cached segment sizes.
    pub fn current_bytes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.lru.weight()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.lru.clear();
    }
}
