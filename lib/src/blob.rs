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
use std::fmt::Debug;
use std::io::Read;
use std::sync::{Arc, RwLock};

use blake2::Blake2b512;
use digest::Digest;

use crate::node::StoreResult;

/// An opaque binary value. Blobs are content-addressed; equal content yields
/// an equal reference.
pub trait Blob: Send + Sync + Debug {
    /// A stable reference that can be stored in a property value.
    fn reference(&self) -> String;

    fn length(&self) -> u64;

    fn read_bytes(&self) -> StoreResult<Vec<u8>>;
}

#[derive(Debug)]
struct MemoryBlob {
    reference: String,
    data: Arc<Vec<u8>>,
}

impl Blob for MemoryBlob {
    fn reference(&self) -> String {
        self.reference.clone()
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_bytes(&self) -> StoreResult<Vec<u8>> {
        Ok(self.data.as_ref().clone())
    }
}

/// Content-addressed in-memory blob storage for the document engine.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        MemoryBlobStore::default()
    }

    pub fn put(&self, content: &mut dyn Read) -> StoreResult<Arc<dyn Blob>> {
        let mut data = vec![];
        content.read_to_end(&mut data)?;
        let mut hasher = Blake2b512::new();
        hasher.update(&data);
        let reference = hex::encode(hasher.finalize());
        let data = Arc::new(data);
        self.blobs
            .write()
            .unwrap()
            .entry(reference.clone())
            .or_insert_with(|| data.clone());
        Ok(Arc::new(MemoryBlob { reference, data }))
    }

    pub fn get(&self, reference: &str) -> Option<Arc<dyn Blob>> {
        let blobs = self.blobs.read().unwrap();
        blobs.get(reference).map(|data| {
            Arc::new(MemoryBlob {
                reference: reference.to_string(),
                data: data.clone(),
            }) as Arc<dyn Blob>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_content_addressed() {
        let store = MemoryBlobStore::new();
        let a = store.put(&mut b"hello".as_slice()).unwrap();
        let b = store.put(&mut b"hello".as_slice()).unwrap();
        let c = store.put(&mut b"world".as_slice()).unwrap();
        assert_eq!(a.reference(), b.reference());
        assert_ne!(a.reference(), c.reference());
        assert_eq!(a.length(), 5);
        assert_eq!(store.get(&a.reference()).unwrap().read_bytes().unwrap(), b"hello");
    }
}
