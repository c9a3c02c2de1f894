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

//! The segment engine: content-addressed immutable segments, HAMT child
//! maps, deduplicated node templates, and a CAS journal for the head.

pub mod cache;
pub mod file_store;
pub mod id;
pub mod map_record;
pub mod node_state;
pub mod node_store;
pub mod reader;
#[allow(clippy::module_inception)]
pub mod segment;
pub mod store;
pub mod template;
pub mod writer;
