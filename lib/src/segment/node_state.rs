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

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};

use crate::node::{
    compare_node_states, missing_node, NodeState, NodeStateDiff, StoreResult,
};
use crate::property::PropertyState;
use crate::segment::id::RecordId;
use crate::segment::map_record::{self, MapDiffVisitor, MapRecord};
use crate::segment::reader::SegmentReader;
use crate::segment::segment::RECORD_ID_BYTES;
use crate::segment::template::{ChildNodes, Template};

/// A node backed by a segment record. Immutable; equality is record-id
/// equality.
pub struct SegmentNodeState {
    reader: Arc<SegmentReader>,
    record_id: RecordId,
}

impl Debug for SegmentNodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentNodeState")
            .field("record_id", &self.record_id)
            .finish_non_exhaustive()
    }
}

impl PartialEq for SegmentNodeState {
    fn eq(&self, other: &Self) -> bool {
        self.record_id == other.record_id
    }
}

impl Eq for SegmentNodeState {}

impl SegmentNodeState {
    pub fn new(reader: Arc<SegmentReader>, record_id: RecordId) -> Self {
        SegmentNodeState { reader, record_id }
    }

    pub fn reader(&self) -> &Arc<SegmentReader> {
        &self.reader
    }

    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    pub fn template(&self) -> StoreResult<Arc<Template>> {
        let segment = self.reader.segment(self.record_id.segment_id())?;
        let template_id = segment.read_record_id(self.record_id.offset())?;
        self.reader.read_template(&template_id)
    }

    fn child_slot(&self) -> u32 {
        self.record_id.offset() + RECORD_ID_BYTES as u32
    }

    fn value_slot(&self, template: &Template, index: usize) -> u32 {
        let child_slots = usize::from(template.child_nodes != ChildNodes::Zero);
        self.record_id.offset()
            + (RECORD_ID_BYTES * (1 + child_slots + index)) as u32
    }

    /// The child-node map of a `Many` template.
    pub fn child_map(&self) -> StoreResult<Option<MapRecord>> {
        let template = self.template()?;
        if !template.has_child_map() {
            return Ok(None);
        }
        let segment = self.reader.segment(self.record_id.segment_id())?;
        let map_id = segment.read_record_id(self.child_slot())?;
        Ok(Some(MapRecord::open(self.reader.clone(), map_id)?))
    }

    fn property_at(&self, template: &Template, index: usize) -> StoreResult<PropertyState> {
        let property = &template.properties[index];
        let segment = self.reader.segment(self.record_id.segment_id())?;
        let value_id = segment.read_record_id(self.value_slot(template, index))?;
        let value = self
            .reader
            .read_property_value(&value_id, property.kind, property.multi)?;
        Ok(PropertyState::new(property.name.clone(), value))
    }
}

impl NodeState for SegmentNodeState {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn exists(&self) -> bool {
        true
    }

    fn property(&self, name: &str) -> StoreResult<Option<PropertyState>> {
        let template = self.template()?;
        match template.property_index(name) {
            Some(index) => Ok(Some(self.property_at(&template, index)?)),
            None => Ok(None),
        }
    }

    fn properties(&self) -> StoreResult<Vec<PropertyState>> {
        let template = self.template()?;
        let mut properties = Vec::with_capacity(template.properties.len());
        for index in 0..template.properties.len() {
            properties.push(self.property_at(&template, index)?);
        }
        Ok(properties)
    }

    fn child(&self, name: &str) -> StoreResult<Arc<dyn NodeState>> {
        let template = self.template()?;
        match &template.child_nodes {
            ChildNodes::Zero => Ok(missing_node()),
            ChildNodes::One(child_name) => {
                if child_name == name {
                    let segment = self.reader.segment(self.record_id.segment_id())?;
                    let child_id = segment.read_record_id(self.child_slot())?;
                    Ok(Arc::new(SegmentNodeState::new(self.reader.clone(), child_id)))
                } else {
                    Ok(missing_node())
                }
            }
            ChildNodes::Many => {
                let map = self.child_map()?.expect("Many template has a child map");
                match map.get(name)? {
                    Some(child_id) => {
                        Ok(Arc::new(SegmentNodeState::new(self.reader.clone(), child_id)))
                    }
                    None => Ok(missing_node()),
                }
            }
        }
    }

    fn child_names(&self) -> StoreResult<Vec<String>> {
        let template = self.template()?;
        match &template.child_nodes {
            ChildNodes::Zero => Ok(vec![]),
            ChildNodes::One(name) => Ok(vec![name.clone()]),
            ChildNodes::Many => {
                let map = self.child_map()?.expect("Many template has a child map");
                let mut names = map.keys()?;
                names.sort();
                Ok(names)
            }
        }
    }
}

/// Segment-aware diff: equal record ids short-circuit, and `Many`/`Many`
/// child maps diff through the HAMT instead of key merging.
pub fn compare_segment_node_states(
    before: &SegmentNodeState,
    after: &SegmentNodeState,
    diff: &mut dyn NodeStateDiff,
) -> StoreResult<bool> {
    if before.record_id == after.record_id {
        return Ok(true);
    }
    let before_template = before.template()?;
    let after_template = after.template()?;
    if before_template.child_nodes != ChildNodes::Many
        || after_template.child_nodes != ChildNodes::Many
    {
        return compare_node_states(before, after, diff);
    }

    if !compare_properties(before, after, diff)? {
        return Ok(false);
    }

    let before_map = before.child_map()?.expect("Many template has a child map");
    let after_map = after.child_map()?.expect("Many template has a child map");
    let mut visitor = ChildMapDiff {
        reader: before.reader.clone(),
        diff,
    };
    map_record::diff(&before_map, &after_map, &mut visitor)
}

fn compare_properties(
    before: &SegmentNodeState,
    after: &SegmentNodeState,
    diff: &mut dyn NodeStateDiff,
) -> StoreResult<bool> {
    let before_props = before.properties()?;
    let after_props = after.properties()?;
    for pair in before_props
        .iter()
        .merge_join_by(after_props.iter(), |b, a| b.name().cmp(a.name()))
    {
        let proceed = match pair {
            EitherOrBoth::Left(b) => diff.property_deleted(b)?,
            EitherOrBoth::Right(a) => diff.property_added(a)?,
            EitherOrBoth::Both(b, a) => {
                if b.value() == a.value() {
                    true
                } else {
                    diff.property_changed(b, a)?
                }
            }
        };
        if !proceed {
            return Ok(false);
        }
    }
    Ok(true)
}

struct ChildMapDiff<'a> {
    reader: Arc<SegmentReader>,
    diff: &'a mut dyn NodeStateDiff,
}

impl MapDiffVisitor for ChildMapDiff<'_> {
    fn entry_added(&mut self, key: &str, after: &RecordId) -> StoreResult<bool> {
        let state = SegmentNodeState::new(self.reader.clone(), after.clone());
        self.diff.child_node_added(key, &state)
    }

    fn entry_changed(
        &mut self,
        key: &str,
        before: &RecordId,
        after: &RecordId,
    ) -> StoreResult<bool> {
        let before = SegmentNodeState::new(self.reader.clone(), before.clone());
        let after = SegmentNodeState::new(self.reader.clone(), after.clone());
        self.diff.child_node_changed(key, &before, &after)
    }

    fn entry_deleted(&mut self, key: &str, before: &RecordId) -> StoreResult<bool> {
        let state = SegmentNodeState::new(self.reader.clone(), before.clone());
        self.diff.child_node_deleted(key, &state)
    }
}
