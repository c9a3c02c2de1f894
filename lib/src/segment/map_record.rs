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

//! Hash-array-mapped trie over segment records, used for child-node maps.
//! A map is a leaf (sorted `(hash, key, value)` triples) or a branch (a
//! 32-bit bitmap plus one child record per set bit); keys partition by five
//! hash bits per level.

#![allow(missing_docs)]

use std::cmp::Ordering;
use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};

use crate::node::{StoreError, StoreResult};
use crate::segment::id::RecordId;
use crate::segment::reader::SegmentReader;
use crate::segment::segment::RECORD_ID_BYTES;

pub const BITS_PER_LEVEL: u32 = 5;
pub const BUCKETS_PER_LEVEL: usize = 1 << BITS_PER_LEVEL;
/// With a 32-bit hash and five bits per level, the trie is at most seven
/// levels deep; the last level holds collision buckets of any size.
pub const MAX_LEVEL: u32 = 7;

const SIZE_BITS: u32 = 28;
const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;

/// The hash that keys partition by. Stable across versions.
pub fn map_hash(key: &str) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for byte in key.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

pub fn bucket_index(hash: u32, level: u32) -> usize {
    ((hash >> (level * BITS_PER_LEVEL)) as usize) & (BUCKETS_PER_LEVEL - 1)
}

/// Whether a map with `size` entries at `level` is stored as a branch.
pub fn is_branch(size: usize, level: u32) -> bool {
    size > BUCKETS_PER_LEVEL && level < MAX_LEVEL - 1
}

#[derive(Clone, Debug)]
pub struct MapEntry {
    pub hash: u32,
    pub key: String,
    pub key_id: RecordId,
    pub value: RecordId,
}

/// Visitor for [`diff`]; callbacks return whether to continue.
pub trait MapDiffVisitor {
    fn entry_added(&mut self, key: &str, after: &RecordId) -> StoreResult<bool>;

    fn entry_changed(
        &mut self,
        key: &str,
        before: &RecordId,
        after: &RecordId,
    ) -> StoreResult<bool>;

    fn entry_deleted(&mut self, key: &str, before: &RecordId) -> StoreResult<bool>;
}

/// A read handle on one map record.
#[derive(Clone, Debug)]
pub struct MapRecord {
    reader: Arc<SegmentReader>,
    id: RecordId,
    size: usize,
    level: u32,
}

impl MapRecord {
    pub fn open(reader: Arc<SegmentReader>, id: RecordId) -> StoreResult<MapRecord> {
        let segment = reader.segment(id.segment_id())?;
        let head = segment.read_u32(id.offset())?;
        let level = head >> SIZE_BITS;
        let size = (head & SIZE_MASK) as usize;
        if level >= MAX_LEVEL {
            return Err(StoreError::Corruption(format!(
                "map record {id} claims level {level}"
            )));
        }
        Ok(MapRecord {
            reader,
            id,
            size,
            level,
        })
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_leaf(&self) -> bool {
        !is_branch(self.size, self.level)
    }

    fn leaf_entry(&self, index: usize) -> StoreResult<(u32, RecordId, RecordId)> {
        let segment = self.reader.segment(self.id.segment_id())?;
        let hash = segment.read_u32(self.id.offset() + 4 + 4 * index as u32)?;
        let ids_base = self.id.offset() + 4 + 4 * self.size as u32;
        let entry = ids_base + (2 * RECORD_ID_BYTES * index) as u32;
        let key_id = segment.read_record_id(entry)?;
        let value_id = segment.read_record_id(entry + RECORD_ID_BYTES as u32)?;
        Ok((hash, key_id, value_id))
    }

    /// Child buckets of a branch, indexed 0..32; `None` for clear bits.
    fn buckets(&self) -> StoreResult<Vec<Option<RecordId>>> {
        let segment = self.reader.segment(self.id.segment_id())?;
        let bitmap = segment.read_u32(self.id.offset() + 4)?;
        let mut buckets = Vec::with_capacity(BUCKETS_PER_LEVEL);
        let mut at = self.id.offset() + 8;
        for index in 0..BUCKETS_PER_LEVEL {
            if bitmap & (1 << index) != 0 {
                buckets.push(Some(segment.read_record_id(at)?));
                at += RECORD_ID_BYTES as u32;
            } else {
                buckets.push(None);
            }
        }
        Ok(buckets)
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<RecordId>> {
        self.get_hashed(key, map_hash(key))
    }

    fn get_hashed(&self, key: &str, hash: u32) -> StoreResult<Option<RecordId>> {
        if self.is_leaf() {
            for index in 0..self.size {
                let (entry_hash, key_id, value_id) = self.leaf_entry(index)?;
                match entry_hash.cmp(&hash) {
                    Ordering::Less => continue,
                    Ordering::Greater => return Ok(None),
                    Ordering::Equal => {
                        if &*self.reader.read_string(&key_id)? == key {
                            return Ok(Some(value_id));
                        }
                    }
                }
            }
            return Ok(None);
        }
        let index = bucket_index(hash, self.level);
        match self.buckets()?[index].clone() {
            None => Ok(None),
            Some(child) => {
                MapRecord::open(self.reader.clone(), child)?.get_hashed(key, hash)
            }
        }
    }

    /// All entries. Leaves yield `(hash, key)`-sorted runs; branches yield
    /// bucket-major trie order.
    pub fn entries(&self) -> StoreResult<Vec<MapEntry>> {
        let mut entries = Vec::with_capacity(self.size);
        self.collect_entries(&mut entries)?;
        Ok(entries)
    }

    fn collect_entries(&self, entries: &mut Vec<MapEntry>) -> StoreResult<()> {
        if self.is_leaf() {
            for index in 0..self.size {
                let (hash, key_id, value) = self.leaf_entry(index)?;
                entries.push(MapEntry {
                    hash,
                    key: self.reader.read_string(&key_id)?.to_string(),
                    key_id,
                    value,
                });
            }
            return Ok(());
        }
        for child in self.buckets()?.into_iter().flatten() {
            MapRecord::open(self.reader.clone(), child)?.collect_entries(entries)?;
        }
        Ok(())
    }

    pub fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|e| e.key).collect())
    }
}

/// Structural diff of two maps. Leaves are walked in parallel hash order;
/// same-level branches recurse bucket by bucket, skipping buckets with
/// equal record ids. Returns `false` if the visitor aborted.
pub fn diff(
    before: &MapRecord,
    after: &MapRecord,
    visitor: &mut dyn MapDiffVisitor,
) -> StoreResult<bool> {
    if before.id == after.id {
        return Ok(true);
    }
    if !before.is_leaf() && !after.is_leaf() && before.level == after.level {
        let before_buckets = before.buckets()?;
        let after_buckets = after.buckets()?;
        for (b, a) in before_buckets.into_iter().zip(after_buckets) {
            let proceed = match (b, a) {
                (None, None) => true,
                (Some(b), None) => {
                    let child = MapRecord::open(before.reader.clone(), b)?;
                    visit_all(&child, visitor, Visit::Deleted)?
                }
                (None, Some(a)) => {
                    let child = MapRecord::open(after.reader.clone(), a)?;
                    visit_all(&child, visitor, Visit::Added)?
                }
                (Some(b), Some(a)) => {
                    if b == a {
                        true
                    } else {
                        let b = MapRecord::open(before.reader.clone(), b)?;
                        let a = MapRecord::open(after.reader.clone(), a)?;
                        diff(&b, &a, visitor)?
                    }
                }
            };
            if !proceed {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    // Leaf-to-leaf (and shape-mismatch fallback): merge in (hash, key)
    // order.
    let sort = |mut entries: Vec<MapEntry>| {
        entries.sort_by(|x, y| x.hash.cmp(&y.hash).then_with(|| x.key.cmp(&y.key)));
        entries
    };
    let before_entries = sort(before.entries()?);
    let after_entries = sort(after.entries()?);
    for pair in before_entries
        .into_iter()
        .merge_join_by(after_entries, |b, a| {
            b.hash.cmp(&a.hash).then_with(|| b.key.cmp(&a.key))
        })
    {
        let proceed = match pair {
            EitherOrBoth::Left(b) => visitor.entry_deleted(&b.key, &b.value)?,
            EitherOrBoth::Right(a) => visitor.entry_added(&a.key, &a.value)?,
            EitherOrBoth::Both(b, a) => {
                if b.value == a.value {
                    true
                } else {
                    visitor.entry_changed(&b.key, &b.value, &a.value)?
                }
            }
        };
        if !proceed {
            return Ok(false);
        }
    }
    Ok(true)
}

#[derive(Clone, Copy)]
enum Visit {
    Added,
    Deleted,
}

fn visit_all(
    map: &MapRecord,
    visitor: &mut dyn MapDiffVisitor,
    kind: Visit,
) -> StoreResult<bool> {
    for entry in map.entries()? {
        let proceed = match kind {
            Visit::Added => visitor.entry_added(&entry.key, &entry.value)?,
            Visit::Deleted => visitor.entry_deleted(&entry.key, &entry.value)?,
        };
        if !proceed {
            return Ok(false);
        }
    }
    Ok(true)
}
