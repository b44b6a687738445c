use std::ops::Bound;

use crossbeam_skiplist::SkipMap;

use crate::error::Result;

use super::KeyStore;

/// An ordered in-memory key-value store backed by a lock-free skiplist.
/// Used by tests and as the default engine; reads and writes may proceed
/// concurrently from any thread.
#[derive(Debug, Default)]
pub struct Memory {
    data: SkipMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl KeyStore for Memory {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let range = (
            Bound::Included(start.to_vec()),
            Bound::Included(end.to_vec()),
        );
        Ok(self
            .data
            .range(range)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }
}
