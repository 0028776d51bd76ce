//! In-memory [`SnapshotSource`] for testing and dry runs.
//!
//! Holds a synthetic history: each record exists from a creation height
//! (and optionally until a removal height), and each field is a timeline of
//! `(from_height, value)` entries. A snapshot at height `h` reports, per
//! field, the latest entry at or below `h`.
//!
//! Failures can be injected at chosen heights, and an artificial latency
//! makes concurrent access observable through [`MemorySource::peak_in_flight`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{Field, FieldValue, Height, RecordId, Snapshot, SubnetInfo};

use super::SnapshotSource;

#[derive(Debug, Clone, Default)]
struct RecordHistory {
    created_at: Height,
    removed_at: Option<Height>,
    fields: BTreeMap<Field, BTreeMap<Height, FieldValue>>,
}

impl RecordHistory {
    fn exists_at(&self, height: Height) -> bool {
        self.created_at <= height && self.removed_at.map_or(true, |r| height < r)
    }
}

/// Synthetic chain history.
#[derive(Debug, Default)]
pub struct MemorySource {
    head: Height,
    records: BTreeMap<RecordId, RecordHistory>,
    failing: HashSet<Height>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MemorySource {
    /// Create an empty history whose current height is `head`.
    pub fn new(head: Height) -> Self {
        Self {
            head,
            ..Self::default()
        }
    }

    /// Declare a record that exists from `created_at` on.
    pub fn with_record(mut self, netuid: RecordId, created_at: Height) -> Self {
        self.records.entry(netuid).or_default().created_at = created_at;
        self
    }

    /// Remove a record from `height` on.
    pub fn remove_record(mut self, netuid: RecordId, height: Height) -> Self {
        self.records.entry(netuid).or_default().removed_at = Some(height);
        self
    }

    /// Set `field` of `netuid` to `value` from `from` on. Creates the record
    /// at height 0 if it was not declared.
    pub fn set_field(
        mut self,
        netuid: RecordId,
        field: Field,
        from: Height,
        value: Option<&str>,
    ) -> Self {
        self.records
            .entry(netuid)
            .or_default()
            .fields
            .entry(field)
            .or_default()
            .insert(from, value.map(str::to_string));
        self
    }

    /// Make every query at `height` fail.
    pub fn fail_at(mut self, height: Height) -> Self {
        self.failing.insert(height);
        self
    }

    /// Delay every snapshot query by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `snapshot_at` calls served so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of `snapshot_at` calls that were in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// The value `field` of `netuid` has at `height`, ignoring failures.
    pub fn value_at(&self, netuid: RecordId, field: Field, height: Height) -> FieldValue {
        self.records
            .get(&netuid)
            .filter(|r| r.exists_at(height))
            .and_then(|r| r.fields.get(&field))
            .and_then(|timeline| timeline.range(..=height).next_back())
            .and_then(|(_, v)| v.clone())
    }

    fn build_snapshot(&self, height: Height) -> Snapshot {
        self.records
            .iter()
            .filter(|(_, history)| history.exists_at(height))
            .map(|(&netuid, history)| {
                let mut info = SubnetInfo::new(netuid);
                for (&field, timeline) in &history.fields {
                    if let Some((_, Some(value))) = timeline.range(..=height).next_back() {
                        info.set(field, Some(value.clone()));
                    }
                }
                (netuid, info)
            })
            .collect()
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory (head {})", self.head)
    }

    async fn current_height(&self) -> Result<Height> {
        Ok(self.head)
    }

    async fn snapshot_at(&self, height: Height) -> Result<Snapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = if height > self.head {
            Err(anyhow!("height {} is beyond head {}", height, self.head))
        } else if self.failing.contains(&height) {
            Err(anyhow!("injected failure at height {}", height))
        } else {
            Ok(self.build_snapshot(height))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_timeline() {
        let source = MemorySource::new(100)
            .with_record(1, 10)
            .set_field(1, Field::SubnetName, 10, Some("alpha"))
            .set_field(1, Field::SubnetName, 60, Some("beta"))
            .set_field(1, Field::Discord, 30, Some("alpha#1"))
            .set_field(1, Field::Discord, 80, None);

        assert!(source.snapshot_at(5).await.unwrap().is_empty());

        let s20 = source.snapshot_at(20).await.unwrap();
        assert_eq!(Field::SubnetName.value(&s20[&1]), Some("alpha"));
        assert!(s20[&1].subnet_identity.is_none());

        let s60 = source.snapshot_at(60).await.unwrap();
        assert_eq!(Field::SubnetName.value(&s60[&1]), Some("beta"));
        assert_eq!(Field::Discord.value(&s60[&1]), Some("alpha#1"));

        let s90 = source.snapshot_at(90).await.unwrap();
        assert_eq!(Field::Discord.value(&s90[&1]), None);
        assert_eq!(source.value_at(1, Field::SubnetName, 59), Some("alpha".into()));
    }

    #[tokio::test]
    async fn removal_and_failures() {
        let source = MemorySource::new(50)
            .with_record(2, 0)
            .remove_record(2, 40)
            .fail_at(30);

        assert!(source.snapshot_at(39).await.unwrap().contains_key(&2));
        assert!(source.snapshot_at(40).await.unwrap().is_empty());
        assert!(source.snapshot_at(30).await.is_err());
        assert!(source.snapshot_at(51).await.is_err());
        assert_eq!(source.calls(), 4);
        assert_eq!(source.current_height().await.unwrap(), 50);
    }
}
