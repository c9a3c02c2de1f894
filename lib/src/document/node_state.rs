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

use crate::document::document::DocumentNode;
use crate::node::{NodeState, StoreResult};
use crate::path::NodePath;
use crate::property::PropertyState;
use crate::revision::Revision;

/// Store-side reads a [`DocumentNodeState`] needs to resolve children.
pub(crate) trait DocumentReader: Send + Sync + Debug {
    fn read_node(&self, path: &NodePath, revision: &Revision)
        -> StoreResult<Option<DocumentNode>>;

    fn read_child_names(&self, path: &NodePath, revision: &Revision) -> StoreResult<Vec<String>>;
}

/// A node as seen by a reader bound to one read revision.
pub struct DocumentNodeState {
    reader: Arc<dyn DocumentReader>,
    path: NodePath,
    read_revision: Revision,
    node: Option<DocumentNode>,
}

impl Debug for DocumentNodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentNodeState")
            .field("path", &self.path)
            .field("read_revision", &self.read_revision)
            .field("exists", &self.node.is_some())
            .finish_non_exhaustive()
    }
}

impl DocumentNodeState {
    pub(crate) fn new(
        reader: Arc<dyn DocumentReader>,
        path: NodePath,
        read_revision: Revision,
        node: Option<DocumentNode>,
    ) -> Self {
        DocumentNodeState {
            reader,
            path,
            read_revision,
            node,
        }
    }

    pub fn path(&self) -> &NodePath {
        &self.path
    }

    pub fn read_revision(&self) -> Revision {
        self.read_revision
    }

    /// The newest revision that touched this node and is visible to this
    /// reader.
    pub fn last_revision(&self) -> Option<Revision> {
        self.node.as_ref().and_then(|node| node.last_revision)
    }
}

impl NodeState for DocumentNodeState {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn exists(&self) -> bool {
        self.node.is_some()
    }

    fn property(&self, name: &str) -> StoreResult<Option<PropertyState>> {
        Ok(self.node.as_ref().and_then(|node| {
            node.properties
                .get(name)
                .map(|value| PropertyState::new(name, value.clone()))
        }))
    }

    fn properties(&self) -> StoreResult<Vec<PropertyState>> {
        Ok(self
            .node
            .as_ref()
            .map(|node| {
                node.properties
                    .iter()
                    .map(|(name, value)| PropertyState::new(name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn child(&self, name: &str) -> StoreResult<Arc<dyn NodeState>> {
        let path = self.path.join(name);
        let node = if self.node.is_some() {
            self.reader.read_node(&path, &self.read_revision)?
        } else {
            None
        };
        Ok(Arc::new(DocumentNodeState {
            reader: self.reader.clone(),
            path,
            read_revision: self.read_revision,
            node,
        }))
    }

    fn child_names(&self) -> StoreResult<Vec<String>> {
        if self.node.is_none() {
            return Ok(vec![]);
        }
        self.reader.read_child_names(&self.path, &self.read_revision)
    }
}
