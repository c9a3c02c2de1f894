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

use std::fmt::{Debug, Display, Formatter};

use crate::revision::Revision;

/// An absolute, normalized node path: `/` for the root, `/a/b` otherwise.
/// No trailing slash, no empty or dotted components.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePath {
    value: String,
}

impl NodePath {
    pub fn root() -> Self {
        NodePath {
            value: "/".to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.value == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The number of path elements; the root has depth 0.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.value.bytes().filter(|b| *b == b'/').count()
        }
    }

    /// The final path element; empty for the root.
    pub fn name(&self) -> &str {
        if self.is_root() {
            ""
        } else {
            let pos = self.value.rfind('/').unwrap();
            &self.value[pos + 1..]
        }
    }

    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        let pos = self.value.rfind('/').unwrap();
        if pos == 0 {
            Some(NodePath::root())
        } else {
            Some(NodePath {
                value: self.value[..pos].to_string(),
            })
        }
    }

    pub fn join(&self, name: &str) -> NodePath {
        assert!(!name.is_empty() && !name.contains('/'), "bad name {name:?}");
        if self.is_root() {
            NodePath {
                value: format!("/{name}"),
            }
        } else {
            NodePath {
                value: format!("{}/{}", self.value, name),
            }
        }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.value.split('/').filter(|c| !c.is_empty())
    }

    /// The ancestor at the given depth. `ancestor(0)` is the root,
    /// `ancestor(self.depth())` is the path itself.
    pub fn ancestor(&self, depth: usize) -> NodePath {
        assert!(depth <= self.depth(), "no ancestor at depth {depth}");
        let mut path = NodePath::root();
        for component in self.components().take(depth) {
            path = path.join(component);
        }
        path
    }

    pub fn is_ancestor_of(&self, other: &NodePath) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other.value.len() > self.value.len()
            && other.value.starts_with(&self.value)
            && other.value.as_bytes()[self.value.len()] == b'/'
    }

    /// The deepest path that is an ancestor-or-self of both.
    pub fn common_ancestor(&self, other: &NodePath) -> NodePath {
        let mut result = NodePath::root();
        for (a, b) in self.components().zip(other.components()) {
            if a != b {
                break;
            }
            result = result.join(a);
        }
        result
    }

    /// The document id this path is stored under: `"<depth>:<path>"`.
    pub fn document_id(&self) -> String {
        format!("{}:{}", self.depth(), self.value)
    }

    /// The id of a previous (split-off) document holding revisions up to
    /// `high` for this path. Stable across versions.
    pub fn previous_document_id(&self, high: &Revision) -> String {
        let parent_depth = self.parent().map_or(0, |p| p.depth());
        if self.is_root() {
            format!("{}:p/{}", 2 + parent_depth, high)
        } else {
            format!("{}:p{}/{}", 2 + parent_depth, self.value, high)
        }
    }

    /// The id range containing exactly the direct children of this path,
    /// suitable for a document-store range query.
    pub fn children_id_range(&self) -> (String, String) {
        let depth = self.depth() + 1;
        if self.is_root() {
            (format!("{depth}:/"), format!("{depth}:0"))
        } else {
            // '0' is the character after '/'.
            (
                format!("{}:{}/", depth, self.value),
                format!("{}:{}0", depth, self.value),
            )
        }
    }

    pub fn parse(s: &str) -> Option<NodePath> {
        if s == "/" {
            return Some(NodePath::root());
        }
        if !s.starts_with('/') || s.ends_with('/') {
            return None;
        }
        if s[1..].split('/').any(|c| c.is_empty()) {
            return None;
        }
        Some(NodePath {
            value: s.to_string(),
        })
    }

    /// Parses a document id of the form `"<depth>:<path>"` back to the path.
    pub fn from_document_id(id: &str) -> Option<NodePath> {
        let (_, path) = id.split_once(':')?;
        NodePath::parse(path)
    }
}

impl From<&str> for NodePath {
    fn from(value: &str) -> Self {
        NodePath::parse(value).unwrap_or_else(|| panic!("bad path {value:?}"))
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl Debug for NodePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}", &self.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_and_parent() {
        let root = NodePath::root();
        assert_eq!(root.depth(), 0);
        assert_eq!(root.parent(), None);
        assert_eq!(root.name(), "");

        let a = root.join("a");
        let ab = a.join("b");
        assert_eq!(a.depth(), 1);
        assert_eq!(ab.depth(), 2);
        assert_eq!(ab.name(), "b");
        assert_eq!(ab.parent(), Some(a.clone()));
        assert_eq!(a.parent(), Some(root.clone()));
        assert!(root.is_ancestor_of(&ab));
        assert!(a.is_ancestor_of(&ab));
        assert!(!ab.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&a));
    }

    #[test]
    fn common_ancestor() {
        let ab = NodePath::from("/a/b");
        let ac = NodePath::from("/a/c");
        let xy = NodePath::from("/x/y");
        assert_eq!(ab.common_ancestor(&ac), NodePath::from("/a"));
        assert_eq!(ab.common_ancestor(&xy), NodePath::root());
        assert_eq!(ab.common_ancestor(&ab), ab);
    }

    #[test]
    fn document_ids() {
        assert_eq!(NodePath::root().document_id(), "0:/");
        assert_eq!(NodePath::from("/test").document_id(), "1:/test");
        assert_eq!(NodePath::from("/a/b").document_id(), "2:/a/b");
        assert_eq!(
            NodePath::from_document_id("2:/a/b"),
            Some(NodePath::from("/a/b"))
        );
    }

    #[test]
    fn previous_document_ids() {
        let high = Revision::parse("r150-0-1").unwrap();
        assert_eq!(
            NodePath::from("/n").previous_document_id(&high),
            "2:p/n/r150-0-1"
        );
        assert_eq!(
            NodePath::from("/a/b").previous_document_id(&high),
            "3:p/a/b/r150-0-1"
        );
    }

    #[test]
    fn children_id_range_covers_only_children() {
        let (from, to) = NodePath::from("/a").children_id_range();
        let child = NodePath::from("/a/b").document_id();
        let grandchild = NodePath::from("/a/b/c").document_id();
        let sibling = NodePath::from("/ab").document_id();
        assert!(from.as_str() < child.as_str() && child.as_str() < to.as_str());
        // Deeper descendants and siblings have different depth prefixes or
        // sort outside the range.
        assert!(!(from.as_str() < grandchild.as_str() && grandchild.as_str() < to.as_str()));
        assert!(!(from.as_str() < sibling.as_str() && sibling.as_str() < to.as_str()));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(NodePath::parse(""), None);
        assert_eq!(NodePath::parse("a"), None);
        assert_eq!(NodePath::parse("/a/"), None);
        assert_eq!(NodePath::parse("/a//b"), None);
        assert_eq!(NodePath::parse("/"), Some(NodePath::root()));
    }
}
