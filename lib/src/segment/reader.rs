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

//! Typed record decoding across segment boundaries: loads segments through
//! the cache and reads strings, templates, lists and property values.

#![allow(missing_docs)]

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::node::{StoreError, StoreResult};
use crate::property::{PropertyKind, PropertyValue};
use crate::segment::cache::SegmentCache;
use crate::segment::id::{RecordId, SegmentId, SegmentIdFactory};
use crate::segment::segment::{Segment, RECORD_ID_BYTES};
use crate::segment::store::SegmentStore;
use crate::segment::template::{ChildNodes, PropertyTemplate, Template};

/// Long values are chunked into blocks of this many bytes, stored in bulk
/// segments.
pub const BLOCK_SIZE: usize = 4096;

/// List records hold at most this many record ids per bucket.
pub const LIST_BUCKET_SIZE: usize = 255;

// Template head-word flags.
pub const TEMPLATE_HAS_PRIMARY: u32 = 1 << 31;
pub const TEMPLATE_HAS_MIXINS: u32 = 1 << 30;
pub const TEMPLATE_ZERO_CHILD_NODES: u32 = 1 << 29;
pub const TEMPLATE_MANY_CHILD_NODES: u32 = 1 << 28;
pub const TEMPLATE_MIXIN_COUNT_SHIFT: u32 = 18;
pub const TEMPLATE_MIXIN_COUNT_MASK: u32 = 0x3FF;
pub const TEMPLATE_PROPERTY_COUNT_MASK: u32 = (1 << 18) - 1;

/// High bit of a property-template type byte marks a multi-valued property.
pub const PROPERTY_MULTI_FLAG: u8 = 0x80;

/// Loads segments (through the cache) and decodes typed records.
pub struct SegmentReader {
    store: Arc<dyn SegmentStore>,
    cache: Arc<SegmentCache>,
    factory: Arc<SegmentIdFactory>,
}

impl Debug for SegmentReader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader").finish_non_exhaustive()
    }
}

impl SegmentReader {
    pub fn new(
        store: Arc<dyn SegmentStore>,
        cache: Arc<SegmentCache>,
        factory: Arc<SegmentIdFactory>,
    ) -> Self {
        SegmentReader {
            store,
            cache,
            factory,
        }
    }

    pub fn factory(&self) -> &Arc<SegmentIdFactory> {
        &self.factory
    }

    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    pub fn segment(&self, id: &Arc<SegmentId>) -> StoreResult<Arc<Segment>> {
        self.cache.get_or_load(id, || {
            let data = self
                .store
                .read_segment(id)?
                .ok_or_else(|| StoreError::SegmentNotFound(id.to_string()))?;
            Ok(Arc::new(Segment::parse(id.clone(), data, &self.factory)?))
        })
    }

    /// Resolves a list record of `count` ids. A single-element list is
    /// represented by the element itself; larger lists are bucket trees.
    pub fn read_list(&self, id: &RecordId, count: usize) -> StoreResult<Vec<RecordId>> {
        if count == 0 {
            return Ok(vec![]);
        }
        if count == 1 {
            return Ok(vec![id.clone()]);
        }
        let mut bucket_size = 1;
        while bucket_size * LIST_BUCKET_SIZE < count {
            bucket_size *= LIST_BUCKET_SIZE;
        }
        let segment = self.segment(id.segment_id())?;
        let buckets = count.div_ceil(bucket_size);
        let mut ids = Vec::with_capacity(count);
        for i in 0..buckets {
            let child =
                segment.read_record_id(id.offset() + (i * RECORD_ID_BYTES) as u32)?;
            let child_count = bucket_size.min(count - i * bucket_size);
            if child_count == 1 {
                ids.push(child);
            } else {
                ids.extend(self.read_list(&child, child_count)?);
            }
        }
        Ok(ids)
    }

    /// The raw bytes of a length-prefixed value record (inline for small and
    /// medium values, block list for long ones).
    pub fn read_value_bytes(&self, id: &RecordId) -> StoreResult<Vec<u8>> {
        let segment = self.segment(id.segment_id())?;
        let (len, header) = segment.read_length(id.offset())?;
        let len = len as usize;
        if header < 8 {
            return Ok(segment
                .read_bytes(id.offset() + header as u32, len)?
                .to_vec());
        }
        let list_id = segment.read_record_id(id.offset() + 8)?;
        let blocks = self.read_list(&list_id, len.div_ceil(BLOCK_SIZE))?;
        let mut bytes = Vec::with_capacity(len);
        let mut remaining = len;
        for block in blocks {
            let block_len = remaining.min(BLOCK_SIZE);
            let block_segment = self.segment(block.segment_id())?;
            bytes.extend_from_slice(block_segment.read_bytes(block.offset(), block_len)?);
            remaining -= block_len;
        }
        Ok(bytes)
    }

    pub fn read_string(&self, id: &RecordId) -> StoreResult<Arc<str>> {
        let segment = self.segment(id.segment_id())?;
        if let Some(cached) = segment.cached_string(id.offset()) {
            return Ok(cached);
        }
        let bytes = self.read_value_bytes(id)?;
        let value = String::from_utf8(bytes).map_err(|_| {
            StoreError::Corruption(format!("record {id} is not a UTF-8 string"))
        })?;
        Ok(segment.cache_string(id.offset(), Arc::from(value.as_str())))
    }

    pub fn read_template(&self, id: &RecordId) -> StoreResult<Arc<Template>> {
        let segment = self.segment(id.segment_id())?;
        if let Some(cached) = segment.cached_template(id.offset()) {
            return Ok(cached);
        }
        let head = segment.read_u32(id.offset())?;
        let mixin_count = if head & TEMPLATE_HAS_MIXINS != 0 {
            ((head >> TEMPLATE_MIXIN_COUNT_SHIFT) & TEMPLATE_MIXIN_COUNT_MASK) as usize
        } else {
            0
        };
        let property_count = (head & TEMPLATE_PROPERTY_COUNT_MASK) as usize;
        let mut at = id.offset() + 4;

        let primary_type = if head & TEMPLATE_HAS_PRIMARY != 0 {
            let name_id = segment.read_record_id(at)?;
            at += RECORD_ID_BYTES as u32;
            Some(self.read_string(&name_id)?.to_string())
        } else {
            None
        };
        let mut mixin_types = Vec::with_capacity(mixin_count);
        for _ in 0..mixin_count {
            let name_id = segment.read_record_id(at)?;
            at += RECORD_ID_BYTES as u32;
            mixin_types.push(self.read_string(&name_id)?.to_string());
        }
        let child_nodes = if head & TEMPLATE_ZERO_CHILD_NODES != 0 {
            ChildNodes::Zero
        } else if head & TEMPLATE_MANY_CHILD_NODES != 0 {
            ChildNodes::Many
        } else {
            let name_id = segment.read_record_id(at)?;
            at += RECORD_ID_BYTES as u32;
            ChildNodes::One(self.read_string(&name_id)?.to_string())
        };
        let mut properties = Vec::with_capacity(property_count);
        for _ in 0..property_count {
            let name_id = segment.read_record_id(at)?;
            at += RECORD_ID_BYTES as u32;
            let type_byte = segment.read_u8(at)?;
            at += 1;
            let kind = PropertyKind::from_u8(type_byte & !PROPERTY_MULTI_FLAG).ok_or_else(
                || {
                    StoreError::Corruption(format!(
                        "unknown property kind {type_byte} in template {id}"
                    ))
                },
            )?;
            properties.push(PropertyTemplate {
                name: self.read_string(&name_id)?.to_string(),
                kind,
                multi: type_byte & PROPERTY_MULTI_FLAG != 0,
            });
        }
        let template = Template {
            primary_type,
            mixin_types,
            child_nodes,
            properties,
        };
        Ok(segment.cache_template(id.offset(), Arc::new(template)))
    }

    /// Decodes a property value record according to its template slot.
    pub fn read_property_value(
        &self,
        id: &RecordId,
        kind: PropertyKind,
        multi: bool,
    ) -> StoreResult<PropertyValue> {
        if multi {
            let segment = self.segment(id.segment_id())?;
            let count = segment.read_u32(id.offset())? as usize;
            if count == 0 {
                return Ok(PropertyValue::Strings(vec![]));
            }
            let list_id = segment.read_record_id(id.offset() + 4)?;
            let ids = self.read_list(&list_id, count)?;
            let mut values = Vec::with_capacity(count);
            for id in &ids {
                values.push(self.read_string(id)?.to_string());
            }
            return Ok(PropertyValue::Strings(values));
        }
        let text = self.read_string(id)?;
        match kind {
            PropertyKind::String => Ok(PropertyValue::String(text.to_string())),
            PropertyKind::Long => text.parse::<i64>().map(PropertyValue::Long).map_err(|_| {
                StoreError::Corruption(format!("record {id} is not a long value: {text:?}"))
            }),
            PropertyKind::Boolean => match &*text {
                "true" => Ok(PropertyValue::Boolean(true)),
                "false" => Ok(PropertyValue::Boolean(false)),
                _ => Err(StoreError::Corruption(format!(
                    "record {id} is not a boolean value: {text:?}"
                ))),
            },
        }
    }
}
