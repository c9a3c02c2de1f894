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

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueEncodingError {
    #[error("malformed property value {0:?}")]
    Malformed(String),
}

/// The scalar kind of a property, as recorded in segment templates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PropertyKind {
    String,
    Long,
    Boolean,
}

impl PropertyKind {
    pub fn to_u8(self) -> u8 {
        match self {
            PropertyKind::String => 0,
            PropertyKind::Long => 1,
            PropertyKind::Boolean => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<PropertyKind> {
        match value {
            0 => Some(PropertyKind::String),
            1 => Some(PropertyKind::Long),
            2 => Some(PropertyKind::Boolean),
            _ => None,
        }
    }
}

/// A typed property value. Multi-valued properties are homogeneous lists of
/// strings; the engines have no use for typed multi-values beyond that.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Boolean(bool),
    Strings(Vec<String>),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::String(_) | PropertyValue::Strings(_) => PropertyKind::String,
            PropertyValue::Long(_) => PropertyKind::Long,
            PropertyValue::Boolean(_) => PropertyKind::Boolean,
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, PropertyValue::Strings(_))
    }

    /// The escaped form stored in document revision maps. The prefix carries
    /// the type; the encoding must stay bit-stable across versions.
    pub fn encode(&self) -> String {
        match self {
            PropertyValue::String(s) => format!("s:{s}"),
            PropertyValue::Long(n) => format!("l:{n}"),
            PropertyValue::Boolean(b) => format!("b:{b}"),
            PropertyValue::Strings(values) => {
                let mut out = "m:".to_string();
                for value in values {
                    out.push_str(&value.len().to_string());
                    out.push(':');
                    out.push_str(value);
                }
                out
            }
        }
    }

    pub fn decode(encoded: &str) -> Result<PropertyValue, ValueEncodingError> {
        let malformed = || ValueEncodingError::Malformed(encoded.to_string());
        let (prefix, rest) = match encoded.get(..2) {
            Some(prefix) => (prefix, &encoded[2..]),
            None => return Err(malformed()),
        };
        match prefix {
            "s:" => Ok(PropertyValue::String(rest.to_string())),
            "l:" => rest
                .parse::<i64>()
                .map(PropertyValue::Long)
                .map_err(|_| malformed()),
            "b:" => match rest {
                "true" => Ok(PropertyValue::Boolean(true)),
                "false" => Ok(PropertyValue::Boolean(false)),
                _ => Err(malformed()),
            },
            "m:" => {
                let mut values = vec![];
                let mut remaining = rest;
                while !remaining.is_empty() {
                    let (len, tail) = remaining.split_once(':').ok_or_else(malformed)?;
                    let len: usize = len.parse().map_err(|_| malformed())?;
                    if tail.len() < len {
                        return Err(malformed());
                    }
                    let (value, tail) = tail.split_at(len);
                    values.push(value.to_string());
                    remaining = tail;
                }
                Ok(PropertyValue::Strings(values))
            }
            _ => Err(malformed()),
        }
    }
}

/// A named property of a node.
#[derive(Clone, PartialEq, Eq)]
pub struct PropertyState {
    name: String,
    value: PropertyValue,
}

impl Debug for PropertyState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyState")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish()
    }
}

impl PropertyState {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        PropertyState {
            name: name.into(),
            value,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        PropertyState::new(name, PropertyValue::String(value.into()))
    }

    pub fn long(name: impl Into<String>, value: i64) -> Self {
        PropertyState::new(name, PropertyValue::Long(value))
    }

    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        PropertyState::new(name, PropertyValue::Boolean(value))
    }

    pub fn strings(
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        PropertyState::new(
            name,
            PropertyValue::Strings(values.into_iter().map(|v| v.into()).collect()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }
}
