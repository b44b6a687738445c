//! Label merge mapping contract.
//!
//! Merges are managed by an external service; the core only consumes the
//! mapping when translating a user-provided label into the set of labels
//! actually stored.

use std::collections::HashMap;
use std::sync::RwLock;

/// Labels-to-labels union recording merges.
pub trait LabelMapping: Send + Sync {
    /// If the label has been merged away, the representative it now maps to.
    /// None means the label is itself current.
    fn final_label(&self, label: u64) -> Option<u64>;

    /// Every label that currently maps to the given label, including itself.
    fn constituent_labels(&self, label: u64) -> Vec<u64>;
}

/// A simple in-memory merge table.
#[derive(Debug, Default)]
pub struct MergeTable {
    forward: RwLock<HashMap<u64, u64>>,
}

impl MergeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `from` has been merged into `to`.
    pub fn merge(&self, from: u64, to: u64) {
        if from != to {
            self.forward.write().unwrap().insert(from, to);
        }
    }

    fn resolve(forward: &HashMap<u64, u64>, label: u64) -> u64 {
        let mut cur = label;
        while let Some(&next) = forward.get(&cur) {
            cur = next;
        }
        cur
    }
}

impl LabelMapping for MergeTable {
    fn final_label(&self, label: u64) -> Option<u64> {
        let forward = self.forward.read().unwrap();
        match Self::resolve(&forward, label) {
            l if l == label => None,
            l => Some(l),
        }
    }

    fn constituent_labels(&self, label: u64) -> Vec<u64> {
        let forward = self.forward.read().unwrap();
        let mut constituents = vec![label];
        for &from in forward.keys() {
            if from != label && Self::resolve(&forward, from) == label {
                constituents.push(from);
            }
        }
        constituents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmerged_label() {
        let table = MergeTable::new();
        assert_eq!(table.final_label(5), None);
        assert_eq!(table.constituent_labels(5), vec![5]);
    }

    #[test]
    fn test_merge_chain() {
        let table = MergeTable::new();
        table.merge(1, 2);
        table.merge(2, 3);

        assert_eq!(table.final_label(1), Some(3));
        assert_eq!(table.final_label(2), Some(3));
        assert_eq!(table.final_label(3), None);

        let mut constituents = table.constituent_labels(3);
        constituents.sort_unstable();
        assert_eq!(constituents, vec![1, 2, 3]);
    }
}
