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

use std::sync::Arc;

use crate::node::NodeState;
use crate::node_store::CommitResult;

/// Validates or augments a commit before it is published. Hooks run inside
/// the merge; a rejection discards the branch head.
pub trait CommitHook: Send + Sync {
    /// Returns the state to commit, which may differ from `after` if the
    /// hook augments the commit.
    fn process_commit(
        &self,
        before: &dyn NodeState,
        after: Arc<dyn NodeState>,
    ) -> CommitResult<Arc<dyn NodeState>>;
}

/// A hook that accepts every commit unchanged.
#[derive(Debug, Default)]
pub struct EmptyHook;

impl CommitHook for EmptyHook {
    fn process_commit(
        &self,
        _before: &dyn NodeState,
        after: Arc<dyn NodeState>,
    ) -> CommitResult<Arc<dyn NodeState>> {
        Ok(after)
    }
}

/// Runs hooks in order, feeding each hook's output to the next.
pub struct CompositeHook {
    hooks: Vec<Arc<dyn CommitHook>>,
}

impl CompositeHook {
    pub fn new(hooks: Vec<Arc<dyn CommitHook>>) -> Self {
        CompositeHook { hooks }
    }
}

impl CommitHook for CompositeHook {
    fn process_commit(
        &self,
        before: &dyn NodeState,
        after: Arc<dyn NodeState>,
    ) -> CommitResult<Arc<dyn NodeState>> {
        let mut state = after;
        for hook in &self.hooks {
            state = hook.process_commit(before, state)?;
        }
        Ok(state)
    }
}

/// Notified after a commit has been published.
pub trait Observer: Send + Sync {
    fn content_changed(&self, root: Arc<dyn NodeState>);
}
