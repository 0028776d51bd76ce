//! Approximate change scan.
//!
//! Samples the chain at a fixed stride walking down from `end`, fetches all
//! sample heights through the bounded worker pool, then compares each
//! adjacent pair of snapshots (newer, older) in descending order. Every
//! difference is tagged with the older height of its pair.
//!
//! A height whose fetch failed reads as an empty snapshot, so the pairs on
//! either side of it report nothing. Real changes inside those windows are
//! missed; the gap is recorded in the run manifest and logged.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::diff::diff_snapshots;
use crate::fetch::fetch_snapshot;
use crate::models::{ApproxChange, Field, Height};
use crate::pool::{ConcurrencyLimit, WorkerPool};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::source::{JsonRpcSource, SnapshotSource};
use crate::store::SnapshotStore;
use crate::table::{self, ScanManifest};

const SECONDS_PER_DAY: u64 = 60 * 60 * 24;

/// Parameters of one approximate scan.
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// Most recent height sampled.
    pub end: Height,
    /// Oldest height of interest; sampling stops at the first height at or below it.
    pub start: Height,
    pub stride: u64,
    pub concurrency: ConcurrencyLimit,
    pub fields: Vec<Field>,
}

/// What a scan produced.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub changes: Vec<ApproxChange>,
    /// Sampled heights, descending.
    pub sampled: Vec<Height>,
    /// Sampled heights whose fetch failed, descending.
    pub failed_heights: Vec<Height>,
}

/// Command-line overrides for `snaplog scan`.
#[derive(Debug, Clone, Default)]
pub struct ScanOverrides {
    pub end: Option<Height>,
    pub start: Option<Height>,
    pub stride: Option<u64>,
    pub concurrency: Option<ConcurrencyLimit>,
    pub output: Option<std::path::PathBuf>,
}

/// Descending sample heights: `end`, `end - stride`, ... down to the first
/// height at or below `start`. A step that would go below zero is clamped to
/// 0, so the oldest pair may be narrower than `stride`.
pub fn sample_heights(end: Height, start: Height, stride: u64) -> Result<Vec<Height>> {
    if stride == 0 {
        bail!("stride must be > 0");
    }
    if start > end {
        bail!("start height {} is above end height {}", start, end);
    }

    let mut heights = vec![end];
    let mut h = end;
    while h > start {
        h = h.saturating_sub(stride);
        heights.push(h);
    }
    Ok(heights)
}

/// Newer sample of the pair whose older sample is `height`.
///
/// Every pair is `stride` wide except one ending at a clamped 0, which spans
/// `(0, end % stride]`. Without a known `end` the full stride is assumed.
pub fn pair_upper(height: Height, stride: u64, end: Option<Height>) -> Height {
    match end {
        Some(end) if height == 0 && stride > 0 && end % stride != 0 => end % stride,
        _ => height.saturating_add(stride),
    }
}

/// Oldest height covered by a lookback of `days` ending at `end`.
pub fn window_from_lookback(end: Height, days: u64, seconds_per_block: u64) -> Height {
    let blocks = days.saturating_mul(SECONDS_PER_DAY) / seconds_per_block.max(1);
    end.saturating_sub(blocks)
}

/// Fetch every sample height and diff adjacent pairs.
pub async fn scan(
    source: &dyn SnapshotSource,
    params: &ScanParams,
    progress: &dyn ProgressReporter,
) -> Result<ScanReport> {
    let heights = sample_heights(params.end, params.start, params.stride)?;
    let total = heights.len() as u64;
    info!(
        end = params.end,
        start = params.start,
        stride = params.stride,
        samples = total,
        concurrency = %params.concurrency,
        "scanning"
    );

    let mut store = SnapshotStore::new();
    let mut fetched = 0u64;
    WorkerPool::new(params.concurrency)
        .run(
            heights.iter().copied(),
            |height| async move { (height, fetch_snapshot(source, height).await) },
            |(height, outcome)| {
                store.insert(height, outcome);
                fetched += 1;
                progress.report(ProgressEvent::Fetching { n: fetched, total });
            },
        )
        .await;

    let pairs = total.saturating_sub(1);
    let mut changes = Vec::new();
    for (i, pair) in heights.windows(2).enumerate() {
        let (prev, curr) = (pair[0], pair[1]);
        changes.extend(diff_snapshots(
            store.get(prev),
            store.get(curr),
            curr,
            &params.fields,
        ));
        progress.report(ProgressEvent::Comparing {
            n: i as u64 + 1,
            total: pairs,
        });
    }

    let failed_heights = store.failed_heights();
    if !failed_heights.is_empty() {
        warn!(
            failed = failed_heights.len(),
            heights = ?failed_heights,
            "some sample heights could not be fetched; their windows were not compared"
        );
    }
    info!(changes = changes.len(), "scan complete");

    Ok(ScanReport {
        changes,
        sampled: heights,
        failed_heights,
    })
}

/// Resolve the scan window against `source`, scan, and write the approximate
/// table plus its manifest.
pub async fn run_scan_with_source(
    config: &Config,
    source: &dyn SnapshotSource,
    overrides: &ScanOverrides,
    progress: &dyn ProgressReporter,
) -> Result<ScanReport> {
    let head = source
        .current_height()
        .await
        .with_context(|| format!("Cannot reach state source at {}", source.describe()))?;

    let end = overrides.end.unwrap_or(head);
    if end > head {
        bail!("end height {} is above the current head {}", end, head);
    }
    let start = overrides.start.unwrap_or_else(|| {
        window_from_lookback(end, config.scan.lookback_days, config.scan.seconds_per_block)
    });
    let stride = overrides.stride.unwrap_or(config.scan.stride);
    let params = ScanParams {
        end,
        start,
        stride,
        concurrency: overrides.concurrency.unwrap_or(config.scan.concurrency),
        fields: config.scan.tracked_fields()?,
    };

    let report = scan(source, &params, progress).await?;

    let output = overrides
        .output
        .clone()
        .unwrap_or_else(|| config.output.approximate.clone());
    table::write_approximate(&output, &report.changes)?;
    let manifest = ScanManifest::new(&params, &report);
    table::write_manifest(&output, &manifest)?;

    println!("scan {}", source.describe());
    println!("  window: {} -> {} (stride {})", end, start, stride);
    println!("  sampled heights: {}", report.sampled.len());
    println!("  failed heights: {}", report.failed_heights.len());
    println!("  approximate changes: {}", report.changes.len());
    println!("  written: {}", output.display());
    println!("ok");

    Ok(report)
}

/// Print the current head and the window a default scan would cover.
pub async fn run_head_with_source(config: &Config, source: &dyn SnapshotSource) -> Result<Height> {
    let head = source
        .current_height()
        .await
        .with_context(|| format!("Cannot reach state source at {}", source.describe()))?;
    let start = window_from_lookback(head, config.scan.lookback_days, config.scan.seconds_per_block);
    let samples = sample_heights(head, start, config.scan.stride)?.len();

    println!("source: {}", source.describe());
    println!("head: {}", head);
    println!(
        "scan window: {} -> {} ({} days, stride {}, {} samples)",
        head, start, config.scan.lookback_days, config.scan.stride, samples
    );
    Ok(head)
}

/// `snaplog head` against the configured RPC endpoint.
pub async fn run_head(config: &Config) -> Result<Height> {
    let source = JsonRpcSource::new(&config.source)?;
    run_head_with_source(config, &source).await
}

/// `snaplog scan` against the configured RPC endpoint.
pub async fn run_scan(
    config: &Config,
    overrides: &ScanOverrides,
    progress: &dyn ProgressReporter,
) -> Result<ScanReport> {
    let source = JsonRpcSource::new(&config.source)?;
    run_scan_with_source(config, &source, overrides, progress).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::source::MemorySource;

    fn params(end: Height, start: Height, stride: u64) -> ScanParams {
        ScanParams {
            end,
            start,
            stride,
            concurrency: ConcurrencyLimit::default(),
            fields: Field::ALL.to_vec(),
        }
    }

    #[test]
    fn sample_heights_descend_to_start() {
        assert_eq!(sample_heights(100, 0, 100).unwrap(), vec![100, 0]);
        assert_eq!(sample_heights(1000, 750, 100).unwrap(), vec![1000, 900, 800, 700]);
        assert_eq!(sample_heights(1000, 800, 100).unwrap(), vec![1000, 900, 800]);
        assert_eq!(sample_heights(50, 50, 10).unwrap(), vec![50]);
        assert_eq!(sample_heights(250, 0, 100).unwrap(), vec![250, 150, 50, 0]);
        assert_eq!(sample_heights(250, 20, 100).unwrap(), vec![250, 150, 50, 0]);
        assert_eq!(sample_heights(30, 0, 100).unwrap(), vec![30, 0]);
        assert!(sample_heights(10, 20, 5).is_err());
        assert!(sample_heights(10, 0, 0).is_err());
    }

    #[test]
    fn pair_upper_tracks_clamped_pair() {
        assert_eq!(pair_upper(400, 100, Some(1000)), 500);
        assert_eq!(pair_upper(0, 100, Some(1000)), 100);
        assert_eq!(pair_upper(0, 100, Some(1050)), 50);
        assert_eq!(pair_upper(50, 100, Some(1050)), 150);
        assert_eq!(pair_upper(0, 100, None), 100);
    }

    #[tokio::test]
    async fn change_below_first_stride_is_found() {
        let source = MemorySource::new(1050)
            .set_field(1, Field::SubnetName, 0, Some("a"))
            .set_field(1, Field::SubnetName, 30, Some("b"));

        let report = scan(&source, &params(1050, 0, 100), &NoProgress).await.unwrap();
        assert_eq!(report.sampled.last(), Some(&0));
        assert_eq!(
            report.changes,
            vec![ApproxChange {
                height: 0,
                netuid: 1,
                field: Field::SubnetName,
                old_value: Some("b".into()),
                new_value: Some("a".into()),
            }]
        );
    }

    #[test]
    fn lookback_window() {
        // 60 days at 12s per block
        assert_eq!(window_from_lookback(1_000_000, 60, 12), 1_000_000 - 432_000);
        assert_eq!(window_from_lookback(1_000, 60, 12), 0);
    }

    #[tokio::test]
    async fn single_change_between_two_samples() {
        let source = MemorySource::new(100)
            .set_field(5, Field::SubnetName, 0, Some("y"))
            .set_field(5, Field::SubnetName, 37, Some("x"));

        let report = scan(&source, &params(100, 0, 100), &NoProgress).await.unwrap();
        assert_eq!(
            report.changes,
            vec![ApproxChange {
                height: 0,
                netuid: 5,
                field: Field::SubnetName,
                old_value: Some("x".into()),
                new_value: Some("y".into()),
            }]
        );
        assert_eq!(report.sampled, vec![100, 0]);
        assert!(report.failed_heights.is_empty());
    }

    #[tokio::test]
    async fn failed_height_hides_adjacent_windows() {
        let source = MemorySource::new(300)
            .set_field(1, Field::OwnerHotkey, 0, Some("a"))
            .set_field(1, Field::OwnerHotkey, 150, Some("b"))
            .set_field(1, Field::OwnerHotkey, 250, Some("c"))
            .fail_at(200);

        let report = scan(&source, &params(300, 0, 100), &NoProgress).await.unwrap();
        // 250 (b -> c) sits in (200, 300] and 150 (a -> b) in (100, 200]: both touch 200.
        assert!(report.changes.is_empty());
        assert_eq!(report.failed_heights, vec![200]);
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn changes_are_ordered_by_pair_then_record() {
        let source = MemorySource::new(200)
            .set_field(2, Field::SubnetName, 0, Some("two-old"))
            .set_field(2, Field::SubnetName, 150, Some("two-new"))
            .set_field(1, Field::Discord, 0, Some("d0"))
            .set_field(1, Field::Discord, 150, Some("d1"))
            .set_field(1, Field::SubnetName, 0, Some("one"))
            .set_field(1, Field::SubnetName, 50, Some("one-b"));

        let report = scan(&source, &params(200, 0, 100), &NoProgress).await.unwrap();
        let order: Vec<_> = report
            .changes
            .iter()
            .map(|c| (c.height, c.netuid, c.field))
            .collect();
        assert_eq!(
            order,
            vec![
                (100, 1, Field::Discord),
                (100, 2, Field::SubnetName),
                (0, 1, Field::SubnetName),
            ]
        );
    }
}
