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

//! Storage and revision core of the Canopy hierarchical content
//! repository: a tree of nodes with typed properties, multi-writer commits
//! with snapshot isolation, and two interchangeable persistence engines
//! behind one [`node_store::NodeStore`] contract.

#![deny(unused_must_use)]

pub mod blob;
pub mod commit_hook;
pub mod document;
pub mod memory;
pub mod node;
pub mod node_store;
pub mod path;
pub mod property;
pub mod revision;
pub mod root;
pub mod segment;
