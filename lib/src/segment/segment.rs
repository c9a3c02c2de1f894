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

//! An immutable block of packed records. Data segments carry a header
//! (external segment references and root records); bulk segments are raw
//! bytes. Records are addressed by 4-byte-aligned offsets within a 256 KiB
//! address space that the segment occupies the tail of.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use crate::node::{StoreError, StoreResult};
use crate::segment::id::{SegmentId, SegmentIdFactory, RecordId, RECORD_ALIGN};
use crate::segment::template::Template;

/// Segments never exceed 256 KiB.
pub const MAX_SEGMENT_SIZE: usize = 256 * 1024;

/// A data segment can reference at most 255 other segments; reference slot
/// 0xFF addresses the segment itself.
pub const MAX_SEGMENT_REFERENCES: usize = 255;

pub const SELF_REF: u8 = 0xFF;

/// Byte size of one serialized record id: reference slot + offset.
pub const RECORD_ID_BYTES: usize = 3;

/// Byte size of one serialized segment id in the reference table.
pub const SEGMENT_ID_BYTES: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordType {
    Node,
    Template,
    Map,
    Value,
    List,
    Block,
}

impl RecordType {
    pub fn to_u8(self) -> u8 {
        match self {
            RecordType::Node => 0,
            RecordType::Template => 1,
            RecordType::Map => 2,
            RecordType::Value => 3,
            RecordType::List => 4,
            RecordType::Block => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<RecordType> {
        match value {
            0 => Some(RecordType::Node),
            1 => Some(RecordType::Template),
            2 => Some(RecordType::Map),
            3 => Some(RecordType::Value),
            4 => Some(RecordType::List),
            5 => Some(RecordType::Block),
            _ => None,
        }
    }
}

/// Second-chance cache of decoded values keyed by record offset. An 8-bit
/// bitmap tracks which slots were touched since the last
/// `drop_old_entries` pass.
pub(crate) struct OffsetCache<T> {
    entries: HashMap<u32, (T, u8)>,
    recent: u8,
    next_slot: u8,
}

impl<T: Clone> OffsetCache<T> {
    fn new() -> Self {
        OffsetCache {
            entries: HashMap::new(),
            recent: 0,
            next_slot: 0,
        }
    }

    pub fn get(&mut self, offset: u32) -> Option<T> {
        let (value, slot) = self.entries.get(&offset)?;
        self.recent |= 1 << (slot % 8);
        Some(value.clone())
    }

    /// First writer wins: if the offset is already cached the existing value
    /// is returned and the new one discarded.
    pub fn put(&mut self, offset: u32, value: T) -> T {
        if let Some((existing, slot)) = self.entries.get(&offset) {
            self.recent |= 1 << (slot % 8);
            return existing.clone();
        }
        let slot = self.next_slot % 8;
        self.next_slot = self.next_slot.wrapping_add(1);
        self.recent |= 1 << slot;
        self.entries.insert(offset, (value.clone(), slot));
        value
    }

    pub fn drop_old_entries(&mut self) {
        let recent = self.recent;
        self.entries.retain(|_, (_, slot)| recent & (1 << (*slot % 8)) != 0);
        self.recent = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// An immutable, parsed segment.
pub struct Segment {
    id: Arc<SegmentId>,
    data: Vec<u8>,
    refs: Vec<Arc<SegmentId>>,
    roots: Vec<(RecordType, u32)>,
    strings: Mutex<OffsetCache<Arc<str>>>,
    templates: Mutex<OffsetCache<Arc<Template>>>,
}

impl Debug for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("size", &self.data.len())
            .field("refs", &self.refs.len())
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

impl Segment {
    pub fn parse(
        id: Arc<SegmentId>,
        data: Vec<u8>,
        factory: &SegmentIdFactory,
    ) -> StoreResult<Segment> {
        if data.len() > MAX_SEGMENT_SIZE {
            return Err(StoreError::Corruption(format!(
                "segment {id} exceeds the maximum size: {} bytes",
                data.len()
            )));
        }
        if id.is_bulk_segment_id() {
            return Ok(Segment {
                id,
                data,
                refs: vec![],
                roots: vec![],
                strings: Mutex::new(OffsetCache::new()),
                templates: Mutex::new(OffsetCache::new()),
            });
        }
        let header_err = || StoreError::Corruption(format!("truncated header in segment {id}"));
        if data.len() < 3 {
            return Err(header_err());
        }
        let refs_count = data[0] as usize;
        let roots_count = u16::from_be_bytes([data[1], data[2]]) as usize;
        let header_len = 3 + 3 * roots_count + SEGMENT_ID_BYTES * refs_count;
        if data.len() < header_len {
            return Err(header_err());
        }
        let mut roots = Vec::with_capacity(roots_count);
        for i in 0..roots_count {
            let base = 3 + 3 * i;
            let record_type = RecordType::from_u8(data[base]).ok_or_else(|| {
                StoreError::Corruption(format!(
                    "unknown root record type {} in segment {id}",
                    data[base]
                ))
            })?;
            let offset = (u16::from_be_bytes([data[base + 1], data[base + 2]]) as u32)
                << RECORD_ALIGN.trailing_zeros();
            roots.push((record_type, offset));
        }
        let mut refs = Vec::with_capacity(refs_count);
        for i in 0..refs_count {
            let base = 3 + 3 * roots_count + SEGMENT_ID_BYTES * i;
            let msb = u64::from_be_bytes(data[base..base + 8].try_into().unwrap());
            let lsb = u64::from_be_bytes(data[base + 8..base + 16].try_into().unwrap());
            refs.push(factory.get_segment_id(msb, lsb));
        }
        Ok(Segment {
            id,
            data,
            refs,
            roots,
            strings: Mutex::new(OffsetCache::new()),
            templates: Mutex::new(OffsetCache::new()),
        })
    }

    pub fn id(&self) -> &Arc<SegmentId> {
        &self.id
    }

    /// A coarse byte estimate used for the cache budget.
    pub fn size(&self) -> usize {
        self.data.len() + 64 + self.refs.len() * 24
    }

    pub fn roots(&self) -> &[(RecordType, u32)] {
        &self.roots
    }

    pub fn referenced_ids(&self) -> &[Arc<SegmentId>] {
        &self.refs
    }

    /// Maps a logical record offset to an index into the segment's data,
    /// validating that `len` bytes are available.
    fn pos(&self, offset: u32, len: usize) -> StoreResult<usize> {
        let base = MAX_SEGMENT_SIZE - self.data.len();
        let offset = offset as usize;
        if offset < base || offset + len > MAX_SEGMENT_SIZE {
            return Err(StoreError::Corruption(format!(
                "record offset {offset:#x}+{len} out of bounds in segment {}",
                self.id
            )));
        }
        Ok(offset - base)
    }

    pub fn read_bytes(&self, offset: u32, len: usize) -> StoreResult<&[u8]> {
        let pos = self.pos(offset, len)?;
        Ok(&self.data[pos..pos + len])
    }

    pub fn read_u8(&self, offset: u32) -> StoreResult<u8> {
        Ok(self.read_bytes(offset, 1)?[0])
    }

    pub fn read_u16(&self, offset: u32) -> StoreResult<u16> {
        Ok(u16::from_be_bytes(
            self.read_bytes(offset, 2)?.try_into().unwrap(),
        ))
    }

    pub fn read_u32(&self, offset: u32) -> StoreResult<u32> {
        Ok(u32::from_be_bytes(
            self.read_bytes(offset, 4)?.try_into().unwrap(),
        ))
    }

    pub fn read_u64(&self, offset: u32) -> StoreResult<u64> {
        Ok(u64::from_be_bytes(
            self.read_bytes(offset, 8)?.try_into().unwrap(),
        ))
    }

    /// Reads the 3-byte record-id triple at `offset`: reference slot plus
    /// aligned offset. Slot 0xFF resolves to this segment.
    pub fn read_record_id(&self, offset: u32) -> StoreResult<RecordId> {
        let bytes = self.read_bytes(offset, RECORD_ID_BYTES)?;
        let target_offset =
            (u16::from_be_bytes([bytes[1], bytes[2]]) as u32) << RECORD_ALIGN.trailing_zeros();
        let segment_id = if bytes[0] == SELF_REF {
            self.id.clone()
        } else {
            self.refs
                .get(bytes[0] as usize)
                .ok_or_else(|| {
                    StoreError::Corruption(format!(
                        "reference slot {} out of range in segment {}",
                        bytes[0], self.id
                    ))
                })?
                .clone()
        };
        Ok(RecordId::new(segment_id, target_offset))
    }

    /// Reads a length header: one byte below 128, two bytes below 16512,
    /// eight bytes (with the long-value marker) otherwise. Returns the
    /// length and the header size in bytes.
    pub fn read_length(&self, offset: u32) -> StoreResult<(u64, usize)> {
        let head = self.read_u8(offset)?;
        if head < 0x80 {
            Ok((head as u64, 1))
        } else if head < 0xC0 {
            let second = self.read_u8(offset + 1)?;
            Ok(((((head & 0x3F) as u64) << 8) + second as u64 + 0x80, 2))
        } else {
            let raw = self.read_u64(offset)?;
            Ok(((raw & 0x3FFF_FFFF_FFFF_FFFF) + 0x4080, 8))
        }
    }

    pub(crate) fn cached_string(&self, offset: u32) -> Option<Arc<str>> {
        self.strings.lock().unwrap().get(offset)
    }

    pub(crate) fn cache_string(&self, offset: u32, value: Arc<str>) -> Arc<str> {
        self.strings.lock().unwrap().put(offset, value)
    }

    pub(crate) fn cached_template(&self, offset: u32) -> Option<Arc<Template>> {
        self.templates.lock().unwrap().get(offset)
    }

    pub(crate) fn cache_template(&self, offset: u32, value: Arc<Template>) -> Arc<Template> {
        self.templates.lock().unwrap().put(offset, value)
    }

    /// Evicts cached strings and templates that were not touched since the
    /// previous pass.
    pub fn drop_old_cache_entries(&self) {
        self.strings.lock().unwrap().drop_old_entries();
        self.templates.lock().unwrap().drop_old_entries();
    }
}
