// Copyright 2024 meshp2p developers
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Datastore abstraction backing the peer store.

use parking_lot::RwLock;

use std::collections::BTreeMap;

/// Binary key-value store.
#[async_trait::async_trait]
pub trait Datastore: Send + Sync {
    /// Get the value stored under `key`.
    async fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> crate::Result<()>;

    /// Check whether `key` exists.
    async fn has(&self, key: &[u8]) -> crate::Result<bool>;

    /// Remove `key`.
    async fn delete(&self, key: &[u8]) -> crate::Result<()>;

    /// Get all entries whose key starts with `prefix`.
    async fn query(&self, prefix: &[u8]) -> crate::Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory [`Datastore`].
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

#[async_trait::async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &[u8]) -> crate::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> crate::Result<()> {
        self.entries.write().insert(key, value);
        Ok(())
    }

    async fn has(&self, key: &[u8]) -> crate::Result<bool> {
        Ok(self.entries.read().contains_key(key))
    }

    async fn delete(&self, key: &[u8]) -> crate::Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn query(&self, prefix: &[u8]) -> crate::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
