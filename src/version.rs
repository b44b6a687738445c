//! Version DAG and ancestor-walk resolution.
//!
//! The engine exposes a range scan over every versioned copy of a single
//! logical record. The resolver walks ancestors of the requested version
//! toward the root and returns the first copy stored at an ancestor
//! (inclusive). This is the sole place version semantics are interpreted for
//! data keys.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::keys::{DataContext, InstanceId, VersionId};
use crate::store::KeyStore;
use crate::{errdata, errinput};

/// The repository's revision DAG. Merge handling only ever needs one parent
/// per node, so ancestry is a single-parent chain toward the root.
#[derive(Debug, Default)]
pub struct VersionDag {
    parents: RwLock<HashMap<VersionId, Option<VersionId>>>,
}

impl VersionDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node. Roots pass None; every other node names its parent.
    /// Version 0 is reserved for metadata and may not join the DAG.
    pub fn add_node(&self, version: VersionId, parent: Option<VersionId>) -> Result<()> {
        if version == VersionId(0) {
            return errinput!("version 0 is reserved for metadata");
        }
        let mut parents = self.parents.write()?;
        if parents.contains_key(&version) {
            return errinput!("version {} already exists", version.0);
        }
        if let Some(p) = parent {
            if !parents.contains_key(&p) {
                return errinput!("parent version {} does not exist", p.0);
            }
        }
        parents.insert(version, parent);
        Ok(())
    }

    /// The ancestor chain of a version, inclusive, child first.
    pub fn ancestors(&self, version: VersionId) -> Result<Vec<VersionId>> {
        let parents = self.parents.read()?;
        let mut chain = Vec::new();
        let mut cur = Some(version);
        while let Some(v) = cur {
            if chain.contains(&v) {
                return errdata!("version ancestry cycle at {}", v.0);
            }
            cur = match parents.get(&v) {
                Some(parent) => *parent,
                None => return errinput!("version {} does not exist", v.0),
            };
            chain.push(v);
        }
        Ok(chain)
    }

    /// True if `ancestor` lies on the chain from `version` to the root,
    /// inclusive.
    pub fn is_ancestor(&self, ancestor: VersionId, version: VersionId) -> Result<bool> {
        Ok(self.ancestors(version)?.contains(&ancestor))
    }

    /// Picks the value among versioned candidates visible at the target
    /// version: the candidate closest on the ancestor chain wins. Only one
    /// version on the chain can hold a given logical record, so there is no
    /// tie to break. Returns None if no candidate is an ancestor.
    pub fn resolve<'a, T>(
        &self,
        target: VersionId,
        candidates: &'a [(VersionId, T)],
    ) -> Result<Option<&'a T>> {
        for ancestor in self.ancestors(target)? {
            if let Some((_, value)) = candidates.iter().find(|(v, _)| *v == ancestor) {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

/// A versioned view over one data instance: reads resolve through the DAG,
/// writes land at this context's version.
pub struct VersionedCtx<S> {
    pub dag: Arc<VersionDag>,
    pub store: Arc<S>,
    pub data: DataContext,
}

impl<S> Clone for VersionedCtx<S> {
    fn clone(&self) -> Self {
        VersionedCtx {
            dag: self.dag.clone(),
            store: self.store.clone(),
            data: self.data,
        }
    }
}

impl<S: KeyStore> VersionedCtx<S> {
    pub fn new(dag: Arc<VersionDag>, store: Arc<S>, instance: InstanceId, version: VersionId) -> Self {
        VersionedCtx {
            dag,
            store,
            data: DataContext::new(instance, version),
        }
    }

    pub fn version(&self) -> VersionId {
        self.data.version
    }

    /// Resolved read of the record at the given index bytes. An empty stored
    /// value is a tombstone: the record was removed at that version.
    pub fn get(&self, index: &[u8]) -> Result<Option<Vec<u8>>> {
        let min = self.data.min_version_key(index);
        let max = self.data.max_version_key(index);
        let copies = self.store.scan(&min, &max)?;

        let mut candidates = Vec::with_capacity(copies.len());
        for (key, value) in copies {
            candidates.push((self.data.version_from_key(&key)?, value));
        }
        match self.dag.resolve(self.data.version, &candidates)? {
            Some(value) if !value.is_empty() => Ok(Some(value.clone())),
            _ => Ok(None),
        }
    }

    /// Writes the record at this context's version.
    pub fn put(&self, index: &[u8], value: Vec<u8>) -> Result<()> {
        self.store.put(&self.data.construct_key(index), value)
    }

    /// Removes the record at this context's version by writing an empty
    /// tombstone, leaving ancestor versions untouched.
    pub fn delete(&self, index: &[u8]) -> Result<()> {
        self.store.put(&self.data.construct_key(index), Vec::new())
    }

    /// Batch entry for `put` at this version, for atomic multi-key writes.
    pub fn batch_put(&self, index: &[u8], value: Vec<u8>) -> (Vec<u8>, Option<Vec<u8>>) {
        (self.data.construct_key(index), Some(value))
    }

    /// Resolved scan of every record whose index bytes start with the given
    /// prefix: key copies are grouped per index, each group resolved at this
    /// context's version, tombstones dropped.
    pub fn scan_indexed(&self, index_prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut prefix = self.data.instance_prefix();
        prefix.extend_from_slice(index_prefix);
        let copies = self.store.scan_prefix(&prefix)?;

        let mut out = Vec::new();
        let mut group_index: Option<Vec<u8>> = None;
        let mut group: Vec<(VersionId, Vec<u8>)> = Vec::new();
        for (key, value) in copies {
            let index = self.data.index_from_key(&key)?.to_vec();
            let version = self.data.version_from_key(&key)?;
            if group_index.as_ref() != Some(&index) {
                if let Some(done) = group_index.take() {
                    self.push_resolved(&mut out, done, &group)?;
                }
                group_index = Some(index);
                group.clear();
            }
            group.push((version, value));
        }
        if let Some(done) = group_index.take() {
            self.push_resolved(&mut out, done, &group)?;
        }
        Ok(out)
    }

    fn push_resolved(
        &self,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
        index: Vec<u8>,
        group: &[(VersionId, Vec<u8>)],
    ) -> Result<()> {
        if let Some(value) = self.dag.resolve(self.data.version, group)? {
            if !value.is_empty() {
                out.push((index, value.clone()));
            }
        }
        Ok(())
    }
}
