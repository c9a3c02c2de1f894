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

//! Segment identity. Segment IDs are 128-bit values carrying the segment
//! type in the low nibble; the factory interns them behind weak references
//! so identical IDs share one allocation and the set of live IDs doubles as
//! the garbage collector's root set.

#![allow(missing_docs)]

use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, Weak};

use rand::Rng;

/// Low-nibble tag of a data segment id.
pub const DATA_SEGMENT_NIBBLE: u64 = 0xA;
/// Low-nibble tag of a bulk (raw bytes) segment id.
pub const BULK_SEGMENT_NIBBLE: u64 = 0xB;

/// Records are 4-byte aligned within their segment.
pub const RECORD_ALIGN: u32 = 4;

#[derive(PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    msb: u64,
    lsb: u64,
}

impl SegmentId {
    pub fn new(msb: u64, lsb: u64) -> Self {
        SegmentId { msb, lsb }
    }

    pub fn msb(&self) -> u64 {
        self.msb
    }

    pub fn lsb(&self) -> u64 {
        self.lsb
    }

    pub fn is_data_segment_id(&self) -> bool {
        self.lsb & 0xF == DATA_SEGMENT_NIBBLE
    }

    pub fn is_bulk_segment_id(&self) -> bool {
        self.lsb & 0xF == BULK_SEGMENT_NIBBLE
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.msb, self.lsb)
    }
}

impl Debug for SegmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SegmentId").field(&self.to_string()).finish()
    }
}

/// The address of one record: a segment plus a 4-byte-aligned offset within
/// the segment's 256 KiB address space.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    segment_id: Arc<SegmentId>,
    offset: u32,
}

impl RecordId {
    pub fn new(segment_id: Arc<SegmentId>, offset: u32) -> Self {
        assert_eq!(offset % RECORD_ALIGN, 0, "unaligned record offset {offset}");
        RecordId { segment_id, offset }
    }

    pub fn segment_id(&self) -> &Arc<SegmentId> {
        &self.segment_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:x}", self.segment_id, self.offset)
    }
}

impl Debug for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RecordId").field(&self.to_string()).finish()
    }
}

impl RecordId {
    /// Parses the `to_string` form back; used by the journal slot.
    pub fn parse(s: &str, factory: &SegmentIdFactory) -> Option<RecordId> {
        let (id_part, offset_part) = s.split_once(':')?;
        if id_part.len() != 32 {
            return None;
        }
        let msb = u64::from_str_radix(&id_part[..16], 16).ok()?;
        let lsb = u64::from_str_radix(&id_part[16..], 16).ok()?;
        let offset = u32::from_str_radix(offset_part, 16).ok()?;
        if offset % RECORD_ALIGN != 0 {
            return None;
        }
        Some(RecordId::new(factory.get_segment_id(msb, lsb), offset))
    }
}

const INITIAL_BUCKET_BITS: u32 = 10;
const MAX_BUCKET_LEN: usize = 5;

struct IdTable {
    buckets: Vec<Vec<Weak<SegmentId>>>,
    bits: u32,
}

impl IdTable {
    fn index(&self, lsb: u64) -> usize {
        (lsb & ((1 << self.bits) - 1)) as usize
    }
}

/// Weak-interning registry of segment IDs. `get_segment_id` returns the
/// canonical live instance for a 128-bit value, creating one if needed.
pub struct SegmentIdFactory {
    table: Mutex<IdTable>,
}

impl Debug for SegmentIdFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentIdFactory").finish_non_exhaustive()
    }
}

impl Default for SegmentIdFactory {
    fn default() -> Self {
        SegmentIdFactory::new()
    }
}

impl SegmentIdFactory {
    pub fn new() -> Self {
        SegmentIdFactory {
            table: Mutex::new(IdTable {
                buckets: vec![Vec::new(); 1 << INITIAL_BUCKET_BITS],
                bits: INITIAL_BUCKET_BITS,
            }),
        }
    }

    pub fn get_segment_id(&self, msb: u64, lsb: u64) -> Arc<SegmentId> {
        let mut table = self.table.lock().unwrap();
        let index = table.index(lsb);
        let bucket = &mut table.buckets[index];
        bucket.retain(|weak| weak.strong_count() > 0);
        for weak in bucket.iter() {
            if let Some(id) = weak.upgrade() {
                if id.msb == msb && id.lsb == lsb {
                    return id;
                }
            }
        }
        let id = Arc::new(SegmentId::new(msb, lsb));
        bucket.push(Arc::downgrade(&id));
        if bucket.len() > MAX_BUCKET_LEN {
            Self::expand(&mut table);
        }
        id
    }

    /// Doubles the table, redistributing entries by the next higher bit of
    /// the lsb.
    fn expand(table: &mut IdTable) {
        let new_bits = table.bits + 1;
        let mut buckets = vec![Vec::new(); 1 << new_bits];
        let mask = (1u64 << new_bits) - 1;
        for bucket in table.buckets.drain(..) {
            for weak in bucket {
                if let Some(id) = weak.upgrade() {
                    buckets[(id.lsb & mask) as usize].push(Arc::downgrade(&id));
                }
            }
        }
        table.buckets = buckets;
        table.bits = new_bits;
    }

    fn new_segment_id(&self, type_nibble: u64) -> Arc<SegmentId> {
        let mut rng = rand::thread_rng();
        // UUID version 4 in the msb, variant bits in the lsb, segment type
        // in the low nibble.
        let msb = (rng.gen::<u64>() & 0xFFFF_FFFF_FFFF_0FFF) | 0x0000_0000_0000_4000;
        let lsb = (rng.gen::<u64>() & 0x3FFF_FFFF_FFFF_FFF0) | 0x8000_0000_0000_0000 | type_nibble;
        self.get_segment_id(msb, lsb)
    }

    pub fn new_data_segment_id(&self) -> Arc<SegmentId> {
        self.new_segment_id(DATA_SEGMENT_NIBBLE)
    }

    pub fn new_bulk_segment_id(&self) -> Arc<SegmentId> {
        self.new_segment_id(BULK_SEGMENT_NIBBLE)
    }

    /// A snapshot of the segment IDs currently reachable from live
    /// references. Input to the garbage collector's mark phase.
    pub fn referenced_segment_ids(&self) -> Vec<Arc<SegmentId>> {
        let table = self.table.lock().unwrap();
        table
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter().filter_map(Weak::upgrade))
            .collect()
    }
}
