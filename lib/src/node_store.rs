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

//! The storage contract the rest of the repository consumes. Both engines
//! implement [`NodeStore`]; callers never see documents or segments.

#![allow(missing_docs)]

use std::io::Read;
use std::sync::Arc;

use thiserror::Error;

use crate::blob::Blob;
use crate::commit_hook::CommitHook;
use crate::node::{NodeState, StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum CommitError {
    /// A concurrent commit touched the same property or node after this
    /// committer's base revision. The caller may rebase and retry.
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("commit hook rejected the commit: {0}")]
    HookRejected(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CommitResult<T> = std::result::Result<T, CommitError>;

/// A private line of development over a node store. Changes staged with
/// [`set_root`](NodeStoreBranch::set_root) are invisible to other branches
/// until [`merge`](NodeStoreBranch::merge) succeeds.
pub trait NodeStoreBranch {
    /// The head this branch was created from (or last rebased onto).
    fn base(&self) -> Arc<dyn NodeState>;

    /// The branch's current head, including staged changes.
    fn head(&self) -> Arc<dyn NodeState>;

    /// Stages a new head for this branch.
    fn set_root(&mut self, state: Arc<dyn NodeState>) -> StoreResult<()>;

    /// Re-bases the staged changes onto the store's current head and returns
    /// the new branch head.
    fn rebase(&mut self) -> StoreResult<Arc<dyn NodeState>>;

    /// Applies the commit hook to the staged changes and publishes the
    /// result as the store's new head.
    fn merge(&mut self, hook: &dyn CommitHook) -> CommitResult<Arc<dyn NodeState>>;
}

pub trait NodeStore: Send + Sync {
    /// The current head state.
    fn root(&self) -> StoreResult<Arc<dyn NodeState>>;

    /// Starts a new branch at the current head.
    fn branch(&self) -> StoreResult<Box<dyn NodeStoreBranch + '_>>;

    /// Creates a checkpoint of the current head, protected from garbage
    /// collection for `lifetime_ms` milliseconds. Returns an opaque token.
    fn checkpoint(&self, lifetime_ms: u64) -> StoreResult<String>;

    /// Resolves a checkpoint token; `None` if unknown or expired.
    fn retrieve(&self, checkpoint: &str) -> StoreResult<Option<Arc<dyn NodeState>>>;

    fn create_blob(&self, content: &mut dyn Read) -> StoreResult<Arc<dyn Blob>>;
}
