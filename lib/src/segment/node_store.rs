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

//! The segment-backed [`NodeStore`]: immutable content-addressed segments
//! with a single CAS-advanced journal slot for the head. A merge writes the
//! new head records, flushes, and swings the journal; on a lost race it
//! rebases and retries a bounded number of times.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::blob::Blob;
use crate::commit_hook::{CommitHook, Observer};
use crate::memory::{MemoryNodeState, NodeBuilder};
use crate::node::{NodeState, StoreError, StoreResult};
use crate::node_store::{CommitError, CommitResult, NodeStore, NodeStoreBranch};
use crate::revision::{Clock, SystemClock};
use crate::segment::cache::{SegmentCache, DEFAULT_SEGMENT_CACHE_BYTES};
use crate::segment::id::{RecordId, SegmentIdFactory};
use crate::segment::node_state::SegmentNodeState;
use crate::segment::reader::SegmentReader;
use crate::segment::store::SegmentStore;
use crate::segment::writer::SegmentWriter;

const MAX_MERGE_RETRIES: usize = 5;

struct CheckpointPin {
    record_id: RecordId,
    expires_at_ms: u64,
}

pub(crate) struct SegInner {
    store: Arc<dyn SegmentStore>,
    factory: Arc<SegmentIdFactory>,
    reader: Arc<SegmentReader>,
    writer: SegmentWriter,
    wall_clock: Arc<dyn Clock>,
    checkpoint_counter: AtomicU64,
    checkpoints: Mutex<HashMap<String, CheckpointPin>>,
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

impl Debug for SegInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentNodeStore").finish_non_exhaustive()
    }
}

/// A node store over content-addressed segments.
#[derive(Clone)]
pub struct SegmentNodeStore {
    inner: Arc<SegInner>,
}

impl Debug for SegmentNodeStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl SegmentNodeStore {
    pub fn new(store: Arc<dyn SegmentStore>) -> StoreResult<Self> {
        Self::with_options(store, DEFAULT_SEGMENT_CACHE_BYTES, Arc::new(SystemClock))
    }

    pub fn with_options(
        store: Arc<dyn SegmentStore>,
        cache_bytes: usize,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        let factory = Arc::new(SegmentIdFactory::new());
        let cache = Arc::new(SegmentCache::new(cache_bytes));
        let reader = Arc::new(SegmentReader::new(store.clone(), cache, factory.clone()));
        let writer = SegmentWriter::new(store.clone(), reader.clone(), factory.clone());
        let inner = Arc::new(SegInner {
            store,
            factory,
            reader,
            writer,
            wall_clock: clock,
            checkpoint_counter: AtomicU64::new(0),
            checkpoints: Mutex::new(HashMap::new()),
            observers: Mutex::new(vec![]),
        });
        let this = SegmentNodeStore { inner };
        this.init_empty_head()?;
        Ok(this)
    }

    fn init_empty_head(&self) -> StoreResult<()> {
        let journal = self.inner.store.journal();
        while journal.head()?.is_none() {
            let empty = NodeBuilder::new_node().state();
            let record_id = self.inner.writer.write_node(empty.as_ref())?;
            self.inner.writer.flush()?;
            if journal.set_head(None, &record_id.to_string())? {
                break;
            }
        }
        Ok(())
    }

    pub fn factory(&self) -> &Arc<SegmentIdFactory> {
        &self.inner.factory
    }

    pub fn reader(&self) -> &Arc<SegmentReader> {
        &self.inner.reader
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.inner.observers.lock().unwrap().push(observer);
    }

    pub fn head_record_id(&self) -> StoreResult<RecordId> {
        let head = self
            .inner
            .store
            .journal()
            .head()?
            .ok_or_else(|| StoreError::Corruption("journal has no head".to_string()))?;
        RecordId::parse(&head, &self.inner.factory).ok_or_else(|| {
            StoreError::Corruption(format!("journal head {head:?} is not a record id"))
        })
    }

    fn state_at(&self, record_id: RecordId) -> Arc<dyn NodeState> {
        Arc::new(SegmentNodeState::new(self.inner.reader.clone(), record_id))
    }

    fn notify_observers(&self, root: Arc<dyn NodeState>) {
        let observers: Vec<_> = self.inner.observers.lock().unwrap().clone();
        for observer in observers {
            observer.content_changed(root.clone());
        }
    }

    /// Deletes segments not reachable from the journal head or a live
    /// checkpoint. Returns the number of segments removed. Must run without
    /// concurrent writers; in-flight unpublished records would not be
    /// reachable from the mark roots.
    pub fn gc(&self) -> StoreResult<usize> {
        self.inner.writer.flush()?;
        let mut pending: Vec<RecordId> = vec![self.head_record_id()?];
        {
            let checkpoints = self.inner.checkpoints.lock().unwrap();
            pending.extend(checkpoints.values().map(|pin| pin.record_id.clone()));
        }
        let mut marked: HashSet<(u64, u64)> = HashSet::new();
        let mut queue: Vec<Arc<crate::segment::id::SegmentId>> =
            pending.iter().map(|id| id.segment_id().clone()).collect();
        while let Some(id) = queue.pop() {
            if !marked.insert((id.msb(), id.lsb())) {
                continue;
            }
            if id.is_bulk_segment_id() {
                continue;
            }
            let segment = self.inner.reader.segment(&id)?;
            for referenced in segment.referenced_ids() {
                queue.push(referenced.clone());
            }
        }
        let mut removed = 0;
        for (msb, lsb) in self.inner.store.segment_ids()? {
            if !marked.contains(&(msb, lsb)) {
                let id = self.inner.factory.get_segment_id(msb, lsb);
                self.inner.store.remove_segment(&id)?;
                removed += 1;
            }
        }
        self.inner.writer.clear_dedup_caches();
        Ok(removed)
    }
}

impl NodeStore for SegmentNodeStore {
    fn root(&self) -> StoreResult<Arc<dyn NodeState>> {
        Ok(self.state_at(self.head_record_id()?))
    }

    fn branch(&self) -> StoreResult<Box<dyn NodeStoreBranch + '_>> {
        let base_id = self.head_record_id()?;
        let base_state = self.state_at(base_id.clone());
        Ok(Box::new(SegmentNodeStoreBranch {
            store: self.clone(),
            base_id,
            base_state: base_state.clone(),
            head_state: base_state,
        }))
    }

    fn checkpoint(&self, lifetime_ms: u64) -> StoreResult<String> {
        let record_id = self.head_record_id()?;
        let serial = self.inner.checkpoint_counter.fetch_add(1, Ordering::SeqCst);
        let token = format!("{record_id}@{serial}");
        let expires_at_ms = self
            .inner
            .wall_clock
            .now_millis()
            .saturating_add(lifetime_ms);
        self.inner.checkpoints.lock().unwrap().insert(
            token.clone(),
            CheckpointPin {
                record_id,
                expires_at_ms,
            },
        );
        Ok(token)
    }

    fn retrieve(&self, checkpoint: &str) -> StoreResult<Option<Arc<dyn NodeState>>> {
        let record_id = {
            let mut checkpoints = self.inner.checkpoints.lock().unwrap();
            match checkpoints.get(checkpoint) {
                None => return Ok(None),
                Some(pin) if pin.expires_at_ms < self.inner.wall_clock.now_millis() => {
                    checkpoints.remove(checkpoint);
                    return Ok(None);
                }
                Some(pin) => pin.record_id.clone(),
            }
        };
        Ok(Some(self.state_at(record_id)))
    }

    fn create_blob(&self, content: &mut dyn Read) -> StoreResult<Arc<dyn Blob>> {
        let mut bytes = vec![];
        content.read_to_end(&mut bytes)?;
        let record_id = self.inner.writer.write_blob(&bytes)?;
        self.inner.writer.flush()?;
        Ok(Arc::new(SegmentBlob {
            reader: self.inner.reader.clone(),
            record_id,
            length: bytes.len() as u64,
        }))
    }
}

#[derive(Debug)]
struct SegmentBlob {
    reader: Arc<SegmentReader>,
    record_id: RecordId,
    length: u64,
}

impl Blob for SegmentBlob {
    fn reference(&self) -> String {
        self.record_id.to_string()
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn read_bytes(&self) -> StoreResult<Vec<u8>> {
        self.reader.read_value_bytes(&self.record_id)
    }
}

pub struct SegmentNodeStoreBranch {
    store: SegmentNodeStore,
    base_id: RecordId,
    base_state: Arc<dyn NodeState>,
    head_state: Arc<dyn NodeState>,
}

impl NodeStoreBranch for SegmentNodeStoreBranch {
    fn base(&self) -> Arc<dyn NodeState> {
        self.base_state.clone()
    }

    fn head(&self) -> Arc<dyn NodeState> {
        self.head_state.clone()
    }

    fn set_root(&mut self, state: Arc<dyn NodeState>) -> StoreResult<()> {
        self.head_state = state;
        Ok(())
    }

    fn rebase(&mut self) -> StoreResult<Arc<dyn NodeState>> {
        let new_base_id = self.store.head_record_id()?;
        if new_base_id == self.base_id {
            return Ok(self.head_state.clone());
        }
        let new_base = self.store.state_at(new_base_id.clone());
        self.head_state = match self.head_state.as_any().downcast_ref::<MemoryNodeState>() {
            Some(staged) => {
                let rebased: Arc<dyn NodeState> = staged.rebased(new_base.clone())?;
                rebased
            }
            None => new_base.clone(),
        };
        self.base_id = new_base_id;
        self.base_state = new_base;
        Ok(self.head_state.clone())
    }

    fn merge(&mut self, hook: &dyn CommitHook) -> CommitResult<Arc<dyn NodeState>> {
        for attempt in 0..MAX_MERGE_RETRIES {
            if attempt > 0 {
                tracing::debug!(attempt, "journal head moved, rebasing and retrying");
                self.rebase().map_err(CommitError::Store)?;
            }
            let processed =
                hook.process_commit(self.base_state.as_ref(), self.head_state.clone())?;
            let record_id = self.store.inner.writer.write_node(processed.as_ref())?;
            self.store.inner.writer.flush().map_err(CommitError::Store)?;
            if self
                .store
                .inner
                .store
                .journal()
                .set_head(Some(&self.base_id.to_string()), &record_id.to_string())
                .map_err(CommitError::Store)?
            {
                let new_root = self.store.state_at(record_id.clone());
                self.base_id = record_id;
                self.base_state = new_root.clone();
                self.head_state = new_root.clone();
                self.store.notify_observers(new_root.clone());
                return Ok(new_root);
            }
        }
        Err(CommitError::Conflict(format!(
            "journal head kept moving over {MAX_MERGE_RETRIES} merge attempts"
        )))
    }
}
