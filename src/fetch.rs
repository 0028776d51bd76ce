//! Failure-isolating snapshot fetch.
//!
//! A failed query at one height must never abort a batch. [`fetch_snapshot`]
//! logs the error and hands back [`FetchOutcome::Failed`]; callers treat that
//! as an empty snapshot (scanning) or apply their failure policy (refining).

use tracing::{debug, warn};

use crate::models::{Height, Snapshot};
use crate::source::SnapshotSource;

/// Result of querying one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(Snapshot),
    Failed,
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, FetchOutcome::Fetched(_))
    }

    /// The fetched snapshot, if any.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            FetchOutcome::Fetched(snapshot) => Some(snapshot),
            FetchOutcome::Failed => None,
        }
    }

    /// The fetched snapshot, or an empty one on failure.
    pub fn into_snapshot(self) -> Snapshot {
        match self {
            FetchOutcome::Fetched(snapshot) => snapshot,
            FetchOutcome::Failed => Snapshot::new(),
        }
    }
}

/// Fetch the snapshot at `height`, converting any error into `Failed`.
pub async fn fetch_snapshot(source: &dyn SnapshotSource, height: Height) -> FetchOutcome {
    match source.snapshot_at(height).await {
        Ok(snapshot) => {
            debug!(height, records = snapshot.len(), "snapshot fetched");
            FetchOutcome::Fetched(snapshot)
        }
        Err(e) => {
            warn!(height, error = %format!("{:#}", e), "snapshot fetch failed");
            FetchOutcome::Failed
        }
    }
}
