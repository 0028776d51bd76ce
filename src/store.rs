//! Height-indexed snapshot storage for one scan.
//!
//! Filled by the worker pool's single collector, so it needs no internal
//! locking. Failed heights are kept as explicit gaps rather than dropped.

use std::collections::BTreeMap;

use crate::fetch::FetchOutcome;
use crate::models::{Height, Snapshot};

#[derive(Debug, Default)]
pub struct SnapshotStore {
    entries: BTreeMap<Height, FetchOutcome>,
    empty: Snapshot,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, height: Height, outcome: FetchOutcome) {
        self.entries.insert(height, outcome);
    }

    /// Snapshot at `height`; empty if the fetch failed or never happened.
    pub fn get(&self, height: Height) -> &Snapshot {
        self.entries
            .get(&height)
            .and_then(FetchOutcome::snapshot)
            .unwrap_or(&self.empty)
    }

    pub fn contains(&self, height: Height) -> bool {
        self.entries.contains_key(&height)
    }

    /// Heights whose fetch failed, descending.
    pub fn failed_heights(&self) -> Vec<Height> {
        self.entries
            .iter()
            .rev()
            .filter(|(_, outcome)| !outcome.is_ok())
            .map(|(&h, _)| h)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{snapshot_from_records, SubnetInfo};

    #[test]
    fn failed_and_missing_heights_read_empty() {
        let mut store = SnapshotStore::new();
        store.insert(200, FetchOutcome::Fetched(snapshot_from_records([SubnetInfo::new(1)])));
        store.insert(100, FetchOutcome::Failed);
        store.insert(0, FetchOutcome::Failed);

        assert_eq!(store.get(200).len(), 1);
        assert!(store.get(100).is_empty());
        assert!(store.get(50).is_empty());
        assert!(store.contains(100));
        assert!(!store.contains(50));
        assert_eq!(store.failed_heights(), vec![100, 0]);
        assert_eq!(store.len(), 3);
    }
}
