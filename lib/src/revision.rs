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

//! Revisions are the logical timestamps every committed change is keyed by.
//! A revision is a `(timestamp, counter, cluster_id)` triple plus a branch
//! flag. Revisions minted by different cluster nodes are not directly
//! comparable by their timestamps; the [`RevisionComparator`] orders them by
//! when the local node first saw them.

#![allow(missing_docs)]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RevisionError {
    #[error("malformed revision string {0:?}")]
    Malformed(String),
}

/// A logical timestamp issued by a single cluster node.
///
/// The textual form is `r<timestamp>-<counter>-<cluster_id>` with all three
/// fields in lowercase unpadded hex, prefixed with `b` for branch revisions.
/// That form is stored in documents and must stay stable across versions.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Revision {
    timestamp: u64,
    counter: u32,
    cluster_id: u32,
    branch: bool,
}

impl Revision {
    pub fn new(timestamp: u64, counter: u32, cluster_id: u32) -> Self {
        Revision {
            timestamp,
            counter,
            cluster_id,
            branch: false,
        }
    }

    pub fn new_branch(timestamp: u64, counter: u32, cluster_id: u32) -> Self {
        Revision {
            timestamp,
            counter,
            cluster_id,
            branch: true,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn cluster_id(&self) -> u32 {
        self.cluster_id
    }

    pub fn is_branch(&self) -> bool {
        self.branch
    }

    /// The same revision with the branch flag set.
    pub fn as_branch_revision(&self) -> Revision {
        Revision {
            branch: true,
            ..*self
        }
    }

    /// The same revision with the branch flag cleared.
    pub fn as_trunk_revision(&self) -> Revision {
        Revision {
            branch: false,
            ..*self
        }
    }

    pub fn equals_ignore_branch(&self, other: &Revision) -> bool {
        self.timestamp == other.timestamp
            && self.counter == other.counter
            && self.cluster_id == other.cluster_id
    }

    /// Orders two revisions of the *same* cluster by (timestamp, counter).
    /// Not meaningful across clusters; see [`RevisionComparator`].
    pub fn compare_time(&self, other: &Revision) -> Ordering {
        (self.timestamp, self.counter).cmp(&(other.timestamp, other.counter))
    }

    pub fn parse(s: &str) -> Result<Revision, RevisionError> {
        let malformed = || RevisionError::Malformed(s.to_string());
        let (branch, rest) = match s.strip_prefix('b') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let rest = rest.strip_prefix('r').ok_or_else(malformed)?;
        let mut parts = rest.split('-');
        let timestamp = parts
            .next()
            .and_then(|p| u64::from_str_radix(p, 16).ok())
            .ok_or_else(malformed)?;
        let counter = parts
            .next()
            .and_then(|p| u32::from_str_radix(p, 16).ok())
            .ok_or_else(malformed)?;
        let cluster_id = parts
            .next()
            .and_then(|p| u32::from_str_radix(p, 16).ok())
            .ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }
        Ok(Revision {
            timestamp,
            counter,
            cluster_id,
            branch,
        })
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.branch {
            write!(f, "b")?;
        }
        write!(
            f,
            "r{:x}-{:x}-{:x}",
            self.timestamp, self.counter, self.cluster_id
        )
    }
}

impl Debug for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Revision").field(&self.to_string()).finish()
    }
}

// The total order is only used to key revision maps; cross-cluster *visibility*
// ordering goes through RevisionComparator.
impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, self.counter, self.cluster_id, self.branch).cmp(&(
            other.timestamp,
            other.counter,
            other.cluster_id,
            other.branch,
        ))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Source of wall-clock time. Injected so tests control revision timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }
}

/// Mints strictly monotonic revisions for one engine instance.
///
/// System-clock regressions are masked by clamping to the last issued
/// timestamp; revisions minted within one millisecond are disambiguated by
/// the counter.
pub struct RevisionClock {
    clock: Arc<dyn Clock>,
    last: Mutex<(u64, u32)>,
}

impl Debug for RevisionClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionClock").finish_non_exhaustive()
    }
}

impl RevisionClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        RevisionClock {
            clock,
            last: Mutex::new((0, 0)),
        }
    }

    pub fn new_revision(&self, cluster_id: u32) -> Revision {
        let mut last = self.last.lock().unwrap();
        let now = self.clock.now_millis();
        let (timestamp, counter) = if now > last.0 {
            (now, 0)
        } else {
            (last.0, last.1 + 1)
        };
        *last = (timestamp, counter);
        Revision::new(timestamp, counter, cluster_id)
    }
}

/// Where a revision falls relative to the ranges the local node has seen.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Seen {
    /// Within the known ranges; ordered by the local revision it was seen at.
    At(Revision),
    /// Newer than everything recorded for the local cluster.
    Newest,
    /// Newer than everything recorded for a foreign cluster; not yet visible.
    Future,
    /// No range list exists for the cluster.
    Unknown,
}

impl Seen {
    fn rank(&self) -> u8 {
        match self {
            Seen::At(_) => 0,
            Seen::Newest => 1,
            Seen::Future => 2,
            Seen::Unknown => 3,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct SeenRange {
    seen_at: Revision,
    revision: Revision,
}

/// Orders revisions minted on different cluster nodes.
///
/// For every foreign cluster the comparator keeps an ordered list of
/// `(seen_at, revision)` ranges, where `seen_at` is the local revision that
/// was current when the foreign revision was discovered. Two foreign
/// revisions compare by the local revisions they map to. A revision newer
/// than the newest recorded range is `NEWEST` for the local cluster and
/// `FUTURE` (invisible) for a foreign one.
pub struct RevisionComparator {
    local_cluster_id: u32,
    map: RwLock<HashMap<u32, Arc<Vec<SeenRange>>>>,
}

impl Debug for RevisionComparator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionComparator")
            .field("local_cluster_id", &self.local_cluster_id)
            .finish_non_exhaustive()
    }
}

impl RevisionComparator {
    pub fn new(local_cluster_id: u32) -> Self {
        RevisionComparator {
            local_cluster_id,
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_cluster_id(&self) -> u32 {
        self.local_cluster_id
    }

    /// Records that `revision` (minted on some cluster) was first seen at the
    /// local revision `seen_at`. If the last recorded entry has the same
    /// `seen_at` it is replaced, since the new revision cannot be older than
    /// the one recorded for the same local revision.
    pub fn add(&self, revision: Revision, seen_at: Revision) {
        let mut map = self.map.write().unwrap();
        let list = map
            .entry(revision.cluster_id())
            .or_insert_with(|| Arc::new(Vec::new()));
        let entries = Arc::make_mut(list);
        if let Some(last) = entries.last_mut() {
            if last.seen_at.equals_ignore_branch(&seen_at) {
                last.revision = revision;
                return;
            }
            assert!(
                last.revision.compare_time(&revision) != Ordering::Greater,
                "revision {} is older than the most recent range entry {}",
                revision,
                last.revision
            );
        }
        entries.push(SeenRange { seen_at, revision });
    }

    /// Drops ranges that were seen at or before the given local timestamp.
    pub fn purge(&self, timestamp: u64) {
        let mut map = self.map.write().unwrap();
        for list in map.values_mut() {
            let entries = Arc::make_mut(list);
            entries.retain(|range| range.seen_at.timestamp() > timestamp);
        }
        map.retain(|_, list| !list.is_empty());
    }

    fn seen_at(&self, revision: &Revision) -> Seen {
        let list = {
            let map = self.map.read().unwrap();
            match map.get(&revision.cluster_id()) {
                Some(list) => list.clone(),
                None => return Seen::Unknown,
            }
        };
        for range in list.iter() {
            if revision.compare_time(&range.revision) != Ordering::Greater {
                return Seen::At(range.seen_at);
            }
        }
        if revision.cluster_id() == self.local_cluster_id {
            Seen::Newest
        } else {
            Seen::Future
        }
    }

    /// Whether `revision` would classify as `FUTURE`: minted on a foreign
    /// cluster and newer than everything discovered from it so far.
    pub fn is_future(&self, revision: &Revision) -> bool {
        revision.cluster_id() != self.local_cluster_id
            && self.seen_at(revision) == Seen::Future
    }

    pub fn compare(&self, a: &Revision, b: &Revision) -> Ordering {
        if a.cluster_id() == b.cluster_id() {
            return a.compare_time(b);
        }
        let sa = self.seen_at(a);
        let sb = self.seen_at(b);
        if sa == Seen::Unknown || sb == Seen::Unknown {
            // No range information; raw timestamp order is all we have.
            return a
                .compare_time(b)
                .then_with(|| a.cluster_id().cmp(&b.cluster_id()));
        }
        let by_seen = match (sa, sb) {
            (Seen::At(ra), Seen::At(rb)) => ra.compare_time(&rb),
            _ => sa.rank().cmp(&sb.rank()),
        };
        by_seen.then_with(|| a.cluster_id().cmp(&b.cluster_id()))
    }

    /// True if `a` is newer than `b` from the local node's point of view.
    pub fn is_newer(&self, a: &Revision, b: &Revision) -> bool {
        self.compare(a, b) == Ordering::Greater
    }
}
