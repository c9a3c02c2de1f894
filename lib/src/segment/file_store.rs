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

//! A directory-backed segment store: one file per segment, named by the
//! segment id, plus a journal file whose compare-and-swap is serialized by
//! a lock file.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::node::StoreResult;
use crate::segment::id::SegmentId;
use crate::segment::store::{Journal, SegmentStore};

const JOURNAL_FILE: &str = "journal";
const JOURNAL_LOCK_FILE: &str = "journal.lock";
const SEGMENT_SUFFIX: &str = ".seg";

/// Exclusive advisory lock backed by a lock file; released on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn lock(path: PathBuf) -> io::Result<FileLock> {
        loop {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(_) => return Ok(FileLock { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}

/// Persists a temp file at its final content-addressed location. A file
/// that already exists has identical content, so losing the race is fine.
fn persist_temp_file(temp: NamedTempFile, target: &Path) -> io::Result<()> {
    match temp.persist_noclobber(target) {
        Ok(_) => Ok(()),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.error),
    }
}

#[derive(Debug)]
pub struct FileJournal {
    dir: PathBuf,
}

impl FileJournal {
    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn read_head(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(self.journal_path()) {
            Ok(value) => {
                let value = value.trim().to_string();
                Ok(if value.is_empty() { None } else { Some(value) })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Journal for FileJournal {
    fn head(&self) -> StoreResult<Option<String>> {
        Ok(self.read_head()?)
    }

    fn set_head(&self, base: Option<&str>, head: &str) -> StoreResult<bool> {
        let _lock = FileLock::lock(self.dir.join(JOURNAL_LOCK_FILE))?;
        let current = self.read_head()?;
        if current.as_deref() != base {
            return Ok(false);
        }
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(head.as_bytes())?;
        temp.as_file_mut().sync_all()?;
        temp.persist(self.journal_path()).map_err(|err| err.error)?;
        Ok(true)
    }
}

/// One file per segment under a directory.
#[derive(Debug)]
pub struct FileSegmentStore {
    dir: PathBuf,
    journal: FileJournal,
}

impl FileSegmentStore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileSegmentStore {
            journal: FileJournal { dir: dir.clone() },
            dir,
        })
    }

    fn segment_path(&self, id: &SegmentId) -> PathBuf {
        self.dir.join(format!("{id}{SEGMENT_SUFFIX}"))
    }
}

impl SegmentStore for FileSegmentStore {
    fn contains_segment(&self, id: &SegmentId) -> StoreResult<bool> {
        Ok(self.segment_path(id).exists())
    }

    fn read_segment(&self, id: &SegmentId) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(self.segment_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_segment(&self, id: &SegmentId, data: &[u8]) -> StoreResult<()> {
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(data)?;
        temp.as_file_mut().sync_all()?;
        persist_temp_file(temp, &self.segment_path(id))?;
        Ok(())
    }

    fn segment_ids(&self) -> StoreResult<Vec<(u64, u64)>> {
        let mut ids = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(hex) = name.strip_suffix(SEGMENT_SUFFIX) else {
                continue;
            };
            if hex.len() != 32 {
                continue;
            }
            let (Ok(msb), Ok(lsb)) = (
                u64::from_str_radix(&hex[..16], 16),
                u64::from_str_radix(&hex[16..], 16),
            ) else {
                continue;
            };
            ids.push((msb, lsb));
        }
        Ok(ids)
    }

    fn remove_segment(&self, id: &SegmentId) -> StoreResult<()> {
        match fs::remove_file(self.segment_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn journal(&self) -> &dyn Journal {
        &self.journal
    }
}
