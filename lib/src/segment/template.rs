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

use crate::node::{NodeState, StoreResult};
use crate::property::{PropertyKind, PropertyValue};

pub const PRIMARY_TYPE: &str = "jcr:primaryType";
pub const MIXIN_TYPES: &str = "jcr:mixinTypes";

/// How many child nodes a template describes: none, exactly one (with its
/// name), or a child map.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ChildNodes {
    Zero,
    One(String),
    Many,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PropertyTemplate {
    pub name: String,
    pub kind: PropertyKind,
    pub multi: bool,
}

/// The deduplicated shape of a node: type names, the child-count
/// discriminator and the ordered list of property templates. Structurally
/// identical nodes share one template record.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Template {
    pub primary_type: Option<String>,
    pub mixin_types: Vec<String>,
    pub child_nodes: ChildNodes,
    pub properties: Vec<PropertyTemplate>,
}

impl Template {
    /// Derives the template of a node state. The type properties are pulled
    /// out of the property list; the rest is recorded name-sorted.
    pub fn from_state(state: &dyn NodeState) -> StoreResult<Template> {
        let mut primary_type = None;
        let mut mixin_types = vec![];
        let mut properties = vec![];
        for property in state.properties()? {
            match (property.name(), property.value()) {
                (PRIMARY_TYPE, PropertyValue::String(value)) => {
                    primary_type = Some(value.clone());
                }
                (MIXIN_TYPES, PropertyValue::Strings(values)) => {
                    mixin_types = values.clone();
                }
                (name, value) => {
                    properties.push(PropertyTemplate {
                        name: name.to_string(),
                        kind: value.kind(),
                        multi: value.is_multi(),
                    });
                }
            }
        }
        let child_names = state.child_names()?;
        let child_nodes = match child_names.len() {
            0 => ChildNodes::Zero,
            1 => ChildNodes::One(child_names.into_iter().next().unwrap()),
            _ => ChildNodes::Many,
        };
        Ok(Template {
            primary_type,
            mixin_types,
            child_nodes,
            properties,
        })
    }

    /// The index of a property in the value-id array of node records.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn has_child_map(&self) -> bool {
        self.child_nodes == ChildNodes::Many
    }
}
