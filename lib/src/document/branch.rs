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

use std::collections::HashMap;
use std::sync::Mutex;

use crate::path::NodePath;
use crate::revision::Revision;

/// One persisted commit of an unmerged branch, with everything the merge
/// needs to rewrite its marker and re-check conflicts.
#[derive(Clone, Debug)]
pub struct BranchCommit {
    pub revision: Revision,
    pub commit_root: NodePath,
    /// Documents and map keys this commit touched.
    pub touched: Vec<(NodePath, Vec<String>)>,
}

#[derive(Clone, Debug)]
pub struct BranchSnapshot {
    pub base: Revision,
    pub commits: Vec<BranchCommit>,
}

#[derive(Debug)]
struct Branch {
    base: Revision,
    commits: Vec<BranchCommit>,
    /// Last revision per path as staged on this branch, consulted by branch
    /// readers before the persisted `_lastRev` stamps.
    unsaved_last_revs: HashMap<NodePath, Revision>,
}

/// Registry of branches that have persisted commits but are not merged yet.
/// Branches are identified by any of their commit revisions (branch flag
/// ignored).
#[derive(Debug, Default)]
pub struct UnmergedBranches {
    branches: Mutex<Vec<Branch>>,
}

impl UnmergedBranches {
    pub fn new() -> Self {
        UnmergedBranches::default()
    }

    pub fn create(&self, base: Revision, initial: BranchCommit) {
        let mut branches = self.branches.lock().unwrap();
        let mut unsaved_last_revs = HashMap::new();
        for (path, _) in &initial.touched {
            unsaved_last_revs.insert(path.clone(), initial.revision);
        }
        branches.push(Branch {
            base: base.as_trunk_revision(),
            commits: vec![initial],
            unsaved_last_revs,
        });
    }

    fn position_of(branches: &[Branch], member: &Revision) -> Option<usize> {
        branches.iter().position(|b| {
            b.commits
                .iter()
                .any(|c| c.revision.equals_ignore_branch(member))
        })
    }

    pub fn contains(&self, revision: &Revision) -> bool {
        let branches = self.branches.lock().unwrap();
        Self::position_of(&branches, revision).is_some()
    }

    /// The base revision of the branch any of whose commits is `member`.
    pub fn base_of(&self, member: &Revision) -> Option<Revision> {
        let branches = self.branches.lock().unwrap();
        Self::position_of(&branches, member).map(|i| branches[i].base)
    }

    /// Whether `revision` is a commit of the branch identified by `member`.
    pub fn contains_commit(&self, member: &Revision, revision: &Revision) -> bool {
        let branches = self.branches.lock().unwrap();
        match Self::position_of(&branches, member) {
            Some(i) => branches[i]
                .commits
                .iter()
                .any(|c| c.revision.equals_ignore_branch(revision)),
            None => false,
        }
    }

    /// Appends a commit to the branch identified by `member`.
    pub fn add_commit(&self, member: &Revision, commit: BranchCommit) {
        let mut branches = self.branches.lock().unwrap();
        let i = Self::position_of(&branches, member)
            .expect("commit added to a branch that does not exist");
        for (path, _) in &commit.touched {
            branches[i]
                .unsaved_last_revs
                .insert(path.clone(), commit.revision);
        }
        branches[i].commits.push(commit);
    }

    pub fn unsaved_last_rev(&self, member: &Revision, path: &NodePath) -> Option<Revision> {
        let branches = self.branches.lock().unwrap();
        Self::position_of(&branches, member)
            .and_then(|i| branches[i].unsaved_last_revs.get(path).copied())
    }

    pub fn snapshot(&self, member: &Revision) -> Option<BranchSnapshot> {
        let branches = self.branches.lock().unwrap();
        Self::position_of(&branches, member).map(|i| BranchSnapshot {
            base: branches[i].base,
            commits: branches[i].commits.clone(),
        })
    }

    /// Removes the branch on merge (or abandonment).
    pub fn remove(&self, member: &Revision) -> Option<BranchSnapshot> {
        let mut branches = self.branches.lock().unwrap();
        let i = Self::position_of(&branches, member)?;
        let branch = branches.remove(i);
        Some(BranchSnapshot {
            base: branch.base,
            commits: branch.commits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(revision: Revision, path: &str) -> BranchCommit {
        BranchCommit {
            revision,
            commit_root: NodePath::from(path),
            touched: vec![(NodePath::from(path), vec!["p".to_string()])],
        }
    }

    #[test]
    fn branch_membership_ignores_branch_flag() {
        let branches = UnmergedBranches::new();
        let base = Revision::parse("r1-0-1").unwrap();
        let c1 = Revision::parse("r2-0-1").unwrap();
        branches.create(base, commit(c1, "/a"));

        let c1_branch = c1.as_branch_revision();
        assert!(branches.contains(&c1_branch));
        assert_eq!(branches.base_of(&c1_branch), Some(base));
        assert!(branches.contains_commit(&c1_branch, &c1));

        let c2 = Revision::parse("r3-0-1").unwrap();
        assert!(!branches.contains_commit(&c1, &c2));
        branches.add_commit(&c1, commit(c2, "/b"));
        assert!(branches.contains_commit(&c1, &c2));
        assert!(branches.contains_commit(&c2, &c1));
    }

    #[test]
    fn unsaved_last_revs_follow_commits() {
        let branches = UnmergedBranches::new();
        let base = Revision::parse("r1-0-1").unwrap();
        let c1 = Revision::parse("r2-0-1").unwrap();
        let c2 = Revision::parse("r3-0-1").unwrap();
        branches.create(base, commit(c1, "/a"));
        branches.add_commit(&c1, commit(c2, "/a"));
        assert_eq!(
            branches.unsaved_last_rev(&c1, &NodePath::from("/a")),
            Some(c2)
        );
        assert_eq!(branches.unsaved_last_rev(&c1, &NodePath::from("/zz")), None);
    }

    #[test]
    fn remove_drops_the_branch() {
        let branches = UnmergedBranches::new();
        let base = Revision::parse("r1-0-1").unwrap();
        let c1 = Revision::parse("r2-0-1").unwrap();
        branches.create(base, commit(c1, "/a"));
        let snapshot = branches.remove(&c1).unwrap();
        assert_eq!(snapshot.commits.len(), 1);
        assert!(!branches.contains(&c1));
        assert!(branches.remove(&c1).is_none());
    }
}
