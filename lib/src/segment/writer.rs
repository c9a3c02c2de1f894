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

//! Packs records into an in-progress segment buffer. Records fill the tail
//! of the 256 KiB address space downwards, so their offsets stay stable
//! while the header (reference and root tables) grows at the front. The
//! segment is sealed and published when space runs out or on `flush`.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::memory::MemoryNodeState;
use crate::node::{NodeState, StoreError, StoreResult};
use crate::property::PropertyValue;
use crate::segment::id::{RecordId, SegmentId, SegmentIdFactory, RECORD_ALIGN};
use crate::segment::map_record::{bucket_index, is_branch, map_hash, BUCKETS_PER_LEVEL};
use crate::segment::node_state::SegmentNodeState;
use crate::segment::reader::{
    SegmentReader, BLOCK_SIZE, LIST_BUCKET_SIZE, PROPERTY_MULTI_FLAG, TEMPLATE_HAS_MIXINS,
    TEMPLATE_HAS_PRIMARY, TEMPLATE_MANY_CHILD_NODES, TEMPLATE_MIXIN_COUNT_SHIFT,
    TEMPLATE_ZERO_CHILD_NODES,
};
use crate::segment::segment::{
    RecordType, MAX_SEGMENT_REFERENCES, MAX_SEGMENT_SIZE, RECORD_ID_BYTES, SEGMENT_ID_BYTES,
    SELF_REF,
};
use crate::segment::store::SegmentStore;
use crate::segment::template::{ChildNodes, Template};

type RefIds = SmallVec<[RecordId; 8]>;

struct WriterInner {
    segment_id: Arc<SegmentId>,
    buffer: Vec<u8>,
    /// Index of the first used byte; records grow downwards from the end.
    position: usize,
    refs: Vec<Arc<SegmentId>>,
    roots: Vec<(RecordType, u32)>,
    strings: HashMap<String, RecordId>,
    templates: HashMap<Template, RecordId>,
}

/// Append-only record packing; safe to share behind an `Arc`.
pub struct SegmentWriter {
    store: Arc<dyn SegmentStore>,
    reader: Arc<SegmentReader>,
    factory: Arc<SegmentIdFactory>,
    inner: Mutex<WriterInner>,
}

impl Debug for SegmentWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter").finish_non_exhaustive()
    }
}

impl SegmentWriter {
    pub fn new(
        store: Arc<dyn SegmentStore>,
        reader: Arc<SegmentReader>,
        factory: Arc<SegmentIdFactory>,
    ) -> Self {
        let segment_id = factory.new_data_segment_id();
        SegmentWriter {
            store,
            reader,
            factory,
            inner: Mutex::new(WriterInner {
                segment_id,
                buffer: vec![0; MAX_SEGMENT_SIZE],
                position: MAX_SEGMENT_SIZE,
                refs: vec![],
                roots: vec![],
                strings: HashMap::new(),
                templates: HashMap::new(),
            }),
        }
    }

    /// Seals and publishes the in-progress segment, if it has any records.
    pub fn flush(&self) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        self.flush_inner(&mut inner)
    }

    /// Forgets the string and template dedup caches. Required after a
    /// segment sweep, which may have removed the segments they point into.
    pub fn clear_dedup_caches(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.clear();
        inner.templates.clear();
    }

    fn flush_inner(&self, inner: &mut WriterInner) -> StoreResult<()> {
        if inner.position == MAX_SEGMENT_SIZE {
            return Ok(());
        }
        if inner.roots.len() > u16::MAX as usize {
            return Err(StoreError::Corruption(
                "too many root records in one segment".to_string(),
            ));
        }
        let mut data = Vec::with_capacity(
            3 + 3 * inner.roots.len()
                + SEGMENT_ID_BYTES * inner.refs.len()
                + (MAX_SEGMENT_SIZE - inner.position),
        );
        data.push(inner.refs.len() as u8);
        data.extend((inner.roots.len() as u16).to_be_bytes());
        for (record_type, offset) in &inner.roots {
            data.push(record_type.to_u8());
            data.extend(((offset >> RECORD_ALIGN.trailing_zeros()) as u16).to_be_bytes());
        }
        for id in &inner.refs {
            data.extend(id.msb().to_be_bytes());
            data.extend(id.lsb().to_be_bytes());
        }
        data.extend_from_slice(&inner.buffer[inner.position..]);
        self.store.write_segment(&inner.segment_id, &data)?;

        inner.segment_id = self.factory.new_data_segment_id();
        inner.position = MAX_SEGMENT_SIZE;
        inner.refs.clear();
        inner.roots.clear();
        Ok(())
    }

    /// Header bytes the segment needs with one more root and the given
    /// reference count.
    fn header_len(roots: usize, refs: usize) -> usize {
        3 + 3 * roots + SEGMENT_ID_BYTES * refs
    }

    /// Reserves space for a record of `size` bytes referencing `ids`,
    /// flushing the current segment first if it cannot fit. Returns the
    /// record's offset.
    fn prepare(
        &self,
        inner: &mut WriterInner,
        record_type: RecordType,
        size: usize,
        ids: &[RecordId],
    ) -> StoreResult<u32> {
        let aligned = size.div_ceil(RECORD_ALIGN as usize) * RECORD_ALIGN as usize;
        loop {
            let mut new_refs = 0;
            for id in ids {
                let segment_id = id.segment_id();
                if **segment_id == *inner.segment_id {
                    continue;
                }
                if !inner.refs.iter().any(|r| **r == **segment_id) {
                    new_refs += 1;
                }
            }
            if inner.refs.len() + new_refs > MAX_SEGMENT_REFERENCES {
                if inner.position == MAX_SEGMENT_SIZE {
                    return Err(StoreError::Corruption(
                        "record references too many segments".to_string(),
                    ));
                }
                self.flush_inner(inner)?;
                continue;
            }
            let header = Self::header_len(inner.roots.len() + 1, inner.refs.len() + new_refs);
            if inner.position < aligned || inner.position - aligned < header {
                if inner.position == MAX_SEGMENT_SIZE {
                    return Err(StoreError::Corruption(format!(
                        "record of {size} bytes does not fit an empty segment"
                    )));
                }
                self.flush_inner(inner)?;
                continue;
            }
            inner.position -= aligned;
            let offset = inner.position as u32;
            inner.roots.push((record_type, offset));
            return Ok(offset);
        }
    }

    fn write_bytes(inner: &mut WriterInner, at: &mut usize, bytes: &[u8]) {
        inner.buffer[*at..*at + bytes.len()].copy_from_slice(bytes);
        *at += bytes.len();
    }

    fn write_record_id(
        &self,
        inner: &mut WriterInner,
        at: &mut usize,
        target: &RecordId,
    ) -> StoreResult<()> {
        let slot = if **target.segment_id() == *inner.segment_id {
            // A same-segment reference; the target is no longer a root.
            inner.roots.retain(|(_, offset)| *offset != target.offset());
            SELF_REF
        } else {
            match inner
                .refs
                .iter()
                .position(|r| **r == **target.segment_id())
            {
                Some(index) => index as u8,
                None => {
                    if inner.refs.len() >= MAX_SEGMENT_REFERENCES {
                        return Err(StoreError::Corruption(
                            "segment reference table overflow".to_string(),
                        ));
                    }
                    inner.refs.push(target.segment_id().clone());
                    (inner.refs.len() - 1) as u8
                }
            }
        };
        let encoded = (target.offset() >> RECORD_ALIGN.trailing_zeros()) as u16;
        Self::write_bytes(inner, at, &[slot]);
        Self::write_bytes(inner, at, &encoded.to_be_bytes());
        Ok(())
    }

    pub fn write_string(&self, value: &str) -> StoreResult<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        self.write_string_inner(&mut inner, value)
    }

    fn write_string_inner(&self, inner: &mut WriterInner, value: &str) -> StoreResult<RecordId> {
        if let Some(id) = inner.strings.get(value) {
            return Ok(id.clone());
        }
        let id = self.write_bytes_value_inner(inner, RecordType::Value, value.as_bytes())?;
        inner.strings.insert(value.to_string(), id.clone());
        Ok(id)
    }

    /// Writes a length-prefixed byte value: inline below 16512 bytes, a
    /// block list in bulk segments otherwise.
    fn write_bytes_value_inner(
        &self,
        inner: &mut WriterInner,
        record_type: RecordType,
        bytes: &[u8],
    ) -> StoreResult<RecordId> {
        let len = bytes.len();
        if len < 0x80 {
            let offset = self.prepare(inner, record_type, 1 + len, &[])?;
            let mut at = offset as usize;
            Self::write_bytes(inner, &mut at, &[len as u8]);
            Self::write_bytes(inner, &mut at, bytes);
            return Ok(RecordId::new(inner.segment_id.clone(), offset));
        }
        if len < 0x4080 {
            let offset = self.prepare(inner, record_type, 2 + len, &[])?;
            let head = (len - 0x80) as u16 | 0x8000;
            let mut at = offset as usize;
            Self::write_bytes(inner, &mut at, &head.to_be_bytes());
            Self::write_bytes(inner, &mut at, bytes);
            return Ok(RecordId::new(inner.segment_id.clone(), offset));
        }

        // Long value: raw blocks in bulk segments, referenced via a list.
        let mut block_ids = vec![];
        for chunk in bytes.chunks(MAX_SEGMENT_SIZE) {
            let bulk_id = self.factory.new_bulk_segment_id();
            // Pad to the record alignment so block offsets stay aligned; the
            // value length bounds every read, so padding is never returned.
            let mut data = chunk.to_vec();
            while data.len() % RECORD_ALIGN as usize != 0 {
                data.push(0);
            }
            self.store.write_segment(&bulk_id, &data)?;
            let base = (MAX_SEGMENT_SIZE - data.len()) as u32;
            for block_start in (0..chunk.len()).step_by(BLOCK_SIZE) {
                block_ids.push(RecordId::new(bulk_id.clone(), base + block_start as u32));
            }
        }
        let list_id = self
            .write_list_inner(inner, &block_ids)?
            .expect("long value has at least one block");
        let refs = [list_id.clone()];
        let offset = self.prepare(inner, record_type, 8 + RECORD_ID_BYTES, &refs)?;
        let head = 0xC000_0000_0000_0000u64 | (len as u64 - 0x4080);
        let mut at = offset as usize;
        Self::write_bytes(inner, &mut at, &head.to_be_bytes());
        self.write_record_id(inner, &mut at, &list_id)?;
        Ok(RecordId::new(inner.segment_id.clone(), offset))
    }

    fn write_list_inner(
        &self,
        inner: &mut WriterInner,
        ids: &[RecordId],
    ) -> StoreResult<Option<RecordId>> {
        match ids.len() {
            0 => return Ok(None),
            1 => return Ok(Some(ids[0].clone())),
            _ => {}
        }
        let mut level_ids: Vec<RecordId> = ids.to_vec();
        while level_ids.len() > 1 {
            let mut next = vec![];
            for bucket in level_ids.chunks(LIST_BUCKET_SIZE) {
                if bucket.len() == 1 {
                    next.push(bucket[0].clone());
                    continue;
                }
                let offset = self.prepare(
                    inner,
                    RecordType::List,
                    RECORD_ID_BYTES * bucket.len(),
                    bucket,
                )?;
                let mut at = offset as usize;
                for id in bucket {
                    self.write_record_id(inner, &mut at, id)?;
                }
                next.push(RecordId::new(inner.segment_id.clone(), offset));
            }
            level_ids = next;
        }
        Ok(Some(level_ids.pop().unwrap()))
    }

    pub fn write_value(&self, value: &PropertyValue) -> StoreResult<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        self.write_value_inner(&mut inner, value)
    }

    fn write_value_inner(
        &self,
        inner: &mut WriterInner,
        value: &PropertyValue,
    ) -> StoreResult<RecordId> {
        match value {
            PropertyValue::String(s) => self.write_string_inner(inner, s),
            PropertyValue::Long(n) => self.write_string_inner(inner, &n.to_string()),
            PropertyValue::Boolean(b) => {
                self.write_string_inner(inner, if *b { "true" } else { "false" })
            }
            PropertyValue::Strings(values) => {
                let mut ids = Vec::with_capacity(values.len());
                for value in values {
                    ids.push(self.write_string_inner(inner, value)?);
                }
                let list_id = self.write_list_inner(inner, &ids)?;
                let refs: RefIds = list_id.iter().cloned().collect();
                let offset = self.prepare(
                    inner,
                    RecordType::Value,
                    4 + if list_id.is_some() { RECORD_ID_BYTES } else { 0 },
                    &refs,
                )?;
                let mut at = offset as usize;
                Self::write_bytes(inner, &mut at, &(values.len() as u32).to_be_bytes());
                if let Some(list_id) = &list_id {
                    self.write_record_id(inner, &mut at, list_id)?;
                }
                Ok(RecordId::new(inner.segment_id.clone(), offset))
            }
        }
    }

    /// Writes a binary value; the record reads back via
    /// [`SegmentReader::read_value_bytes`].
    pub fn write_blob(&self, bytes: &[u8]) -> StoreResult<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        self.write_bytes_value_inner(&mut inner, RecordType::Value, bytes)
    }

    pub fn write_template(&self, template: &Template) -> StoreResult<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        self.write_template_inner(&mut inner, template)
    }

    fn write_template_inner(
        &self,
        inner: &mut WriterInner,
        template: &Template,
    ) -> StoreResult<RecordId> {
        if let Some(id) = inner.templates.get(template) {
            return Ok(id.clone());
        }
        assert!(template.mixin_types.len() < 1 << 10, "too many mixins");
        assert!(template.properties.len() < 1 << 18, "too many properties");

        let mut head = template.properties.len() as u32;
        head |= (template.mixin_types.len() as u32) << TEMPLATE_MIXIN_COUNT_SHIFT;
        let mut name_ids: RefIds = SmallVec::new();
        if let Some(primary) = &template.primary_type {
            head |= TEMPLATE_HAS_PRIMARY;
            name_ids.push(self.write_string_inner(inner, primary)?);
        }
        if !template.mixin_types.is_empty() {
            head |= TEMPLATE_HAS_MIXINS;
            for mixin in &template.mixin_types {
                name_ids.push(self.write_string_inner(inner, mixin)?);
            }
        }
        match &template.child_nodes {
            ChildNodes::Zero => head |= TEMPLATE_ZERO_CHILD_NODES,
            ChildNodes::Many => head |= TEMPLATE_MANY_CHILD_NODES,
            ChildNodes::One(name) => {
                name_ids.push(self.write_string_inner(inner, name)?);
            }
        }
        let mut property_name_ids = Vec::with_capacity(template.properties.len());
        for property in &template.properties {
            property_name_ids.push(self.write_string_inner(inner, &property.name)?);
        }

        let mut all_refs: Vec<RecordId> = name_ids.to_vec();
        all_refs.extend(property_name_ids.iter().cloned());
        let size = 4
            + RECORD_ID_BYTES * name_ids.len()
            + (RECORD_ID_BYTES + 1) * template.properties.len();
        let offset = self.prepare(inner, RecordType::Template, size, &all_refs)?;
        let mut at = offset as usize;
        Self::write_bytes(inner, &mut at, &head.to_be_bytes());
        for id in &name_ids {
            self.write_record_id(inner, &mut at, id)?;
        }
        for (property, name_id) in template.properties.iter().zip(&property_name_ids) {
            self.write_record_id(inner, &mut at, name_id)?;
            let mut type_byte = property.kind.to_u8();
            if property.multi {
                type_byte |= PROPERTY_MULTI_FLAG;
            }
            Self::write_bytes(inner, &mut at, &[type_byte]);
        }
        let id = RecordId::new(inner.segment_id.clone(), offset);
        inner.templates.insert(template.clone(), id.clone());
        Ok(id)
    }

    pub fn write_map(&self, entries: &BTreeMap<String, RecordId>) -> StoreResult<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        self.write_map_inner(&mut inner, entries)
    }

    fn write_map_inner(
        &self,
        inner: &mut WriterInner,
        entries: &BTreeMap<String, RecordId>,
    ) -> StoreResult<RecordId> {
        let mut prepared = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let key_id = self.write_string_inner(inner, key)?;
            prepared.push((map_hash(key), key.clone(), key_id, value.clone()));
        }
        self.write_map_level(inner, prepared, 0)
    }

    fn write_map_level(
        &self,
        inner: &mut WriterInner,
        mut entries: Vec<(u32, String, RecordId, RecordId)>,
        level: u32,
    ) -> StoreResult<RecordId> {
        if !is_branch(entries.len(), level) {
            entries.sort_by(|(ah, ak, _, _), (bh, bk, _, _)| ah.cmp(bh).then_with(|| ak.cmp(bk)));
            let size = 4 + 4 * entries.len() + 2 * RECORD_ID_BYTES * entries.len();
            let mut refs = Vec::with_capacity(2 * entries.len());
            for (_, _, key_id, value_id) in &entries {
                refs.push(key_id.clone());
                refs.push(value_id.clone());
            }
            let offset = self.prepare(inner, RecordType::Map, size, &refs)?;
            let mut at = offset as usize;
            let head = (level << SIZE_BITS_SHIFT) | entries.len() as u32;
            Self::write_bytes(inner, &mut at, &head.to_be_bytes());
            for (hash, _, _, _) in &entries {
                Self::write_bytes(inner, &mut at, &hash.to_be_bytes());
            }
            for (_, _, key_id, value_id) in &entries {
                self.write_record_id(inner, &mut at, key_id)?;
                self.write_record_id(inner, &mut at, value_id)?;
            }
            return Ok(RecordId::new(inner.segment_id.clone(), offset));
        }

        let total = entries.len() as u32;
        let mut buckets: Vec<Vec<(u32, String, RecordId, RecordId)>> =
            (0..BUCKETS_PER_LEVEL).map(|_| vec![]).collect();
        for entry in entries.drain(..) {
            buckets[bucket_index(entry.0, level)].push(entry);
        }
        let mut bitmap: u32 = 0;
        let mut children = vec![];
        for (index, bucket) in buckets.into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            bitmap |= 1 << index;
            children.push(self.write_map_level(inner, bucket, level + 1)?);
        }
        let size = 4 + 4 + RECORD_ID_BYTES * children.len();
        let offset = self.prepare(inner, RecordType::Map, size, &children)?;
        let mut at = offset as usize;
        let head = (level << SIZE_BITS_SHIFT) | total;
        Self::write_bytes(inner, &mut at, &head.to_be_bytes());
        Self::write_bytes(inner, &mut at, &bitmap.to_be_bytes());
        for child in &children {
            self.write_record_id(inner, &mut at, child)?;
        }
        Ok(RecordId::new(inner.segment_id.clone(), offset))
    }

    /// Writes a node state, reusing existing records where the state (or a
    /// subtree of it) is already segment-backed by this store.
    pub fn write_node(&self, state: &dyn NodeState) -> StoreResult<RecordId> {
        let mut inner = self.inner.lock().unwrap();
        self.write_node_inner(&mut inner, state)
    }

    fn write_node_inner(
        &self,
        inner: &mut WriterInner,
        state: &dyn NodeState,
    ) -> StoreResult<RecordId> {
        if let Some(existing) = state.as_any().downcast_ref::<SegmentNodeState>() {
            if Arc::ptr_eq(existing.reader(), &self.reader) {
                return Ok(existing.record_id().clone());
            }
        }
        if let Some(memory) = state.as_any().downcast_ref::<MemoryNodeState>() {
            if memory.is_unchanged() {
                return self.write_node_inner(inner, memory.base().as_ref());
            }
        }

        let template = Template::from_state(state)?;
        let template_id = self.write_template_inner(inner, &template)?;

        let child_id = match &template.child_nodes {
            ChildNodes::Zero => None,
            ChildNodes::One(name) => {
                let child = state.child(name)?;
                Some(self.write_node_inner(inner, child.as_ref())?)
            }
            ChildNodes::Many => {
                let mut children = BTreeMap::new();
                for name in state.child_names()? {
                    let child = state.child(&name)?;
                    children.insert(name, self.write_node_inner(inner, child.as_ref())?);
                }
                Some(self.write_map_inner(inner, &children)?)
            }
        };

        let mut value_ids = Vec::with_capacity(template.properties.len());
        for property in &template.properties {
            let value = state.property(&property.name)?.ok_or_else(|| {
                StoreError::Corruption(format!(
                    "property {} vanished while writing a node",
                    property.name
                ))
            })?;
            value_ids.push(self.write_value_inner(inner, value.value())?);
        }

        let mut refs: Vec<RecordId> = vec![template_id.clone()];
        refs.extend(child_id.iter().cloned());
        refs.extend(value_ids.iter().cloned());
        let size = RECORD_ID_BYTES * (1 + usize::from(child_id.is_some()) + value_ids.len());
        let offset = self.prepare(inner, RecordType::Node, size, &refs)?;
        let mut at = offset as usize;
        self.write_record_id(inner, &mut at, &template_id)?;
        if let Some(child_id) = &child_id {
            self.write_record_id(inner, &mut at, child_id)?;
        }
        for value_id in &value_ids {
            self.write_record_id(inner, &mut at, value_id)?;
        }
        Ok(RecordId::new(inner.segment_id.clone(), offset))
    }
}

const SIZE_BITS_SHIFT: u32 = 28;
