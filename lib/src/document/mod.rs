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

//! The document engine: nodes as revision-keyed documents over an external
//! document store, with commit-root markers, unmerged branches and split
//! history documents.

pub mod branch;
pub mod commit;
#[allow(clippy::module_inception)]
pub mod document;
pub mod node_state;
pub mod node_store;
pub mod split;
pub mod store;
pub mod update_op;
