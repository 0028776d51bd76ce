//! Exact change refinement.
//!
//! Every approximate change is known to have happened somewhere inside one
//! stride window. [`refine`] binary-searches that window for the first
//! height at which the field holds its new value, costing O(log stride)
//! snapshot queries per change. The probes of one refinement run strictly
//! one after another; separate changes may be refined in parallel through
//! the worker pool.
//!
//! # Failure policy
//!
//! A probe whose query fails is resolved by [`FailurePolicy`]:
//!
//! | Policy | Failed probe is treated as |
//! |--------|----------------------------|
//! | `assume-old` (default) | still the old value; the search moves up |
//! | `assume-new` | already the new value; the search moves down |
//! | `retry:N` | re-queried up to N more times, then `assume-old` |
//! | `abort` | a hard error for this change |
//!
//! Every policy except `abort` keeps the search converging, since each probe
//! still halves the window.
//!
//! # Monotonicity
//!
//! The search assumes the field flips at most once inside the window. When
//! that does not hold it still terminates, but on some transition that may
//! not match the old/new pair. With verification enabled, the result is read
//! back at `h` and `h - 1` and a mismatch is logged and recorded.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fetch::{fetch_snapshot, FetchOutcome};
use crate::models::{ApproxChange, ExactChange, Field, FieldValue, Height, RecordId, Snapshot, Verification};
use crate::pool::{ConcurrencyLimit, WorkerPool};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::scan::pair_upper;
use crate::source::{JsonRpcSource, SnapshotSource};
use crate::table::{self, ScanManifest};

/// How a failed probe is interpreted during refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum FailurePolicy {
    #[default]
    AssumeOld,
    AssumeNew,
    Retry {
        attempts: u32,
    },
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "assume-old" => Ok(FailurePolicy::AssumeOld),
            "assume-new" => Ok(FailurePolicy::AssumeNew),
            "abort" => Ok(FailurePolicy::Abort),
            other => {
                let attempts = other
                    .strip_prefix("retry:")
                    .ok_or_else(|| {
                        anyhow!(
                            "Unknown failure policy: '{}'. Must be assume-old, assume-new, retry:N, or abort.",
                            other
                        )
                    })?
                    .parse::<u32>()
                    .with_context(|| format!("invalid retry count in '{}'", other))?;
                Ok(FailurePolicy::Retry { attempts })
            }
        }
    }
}

impl TryFrom<String> for FailurePolicy {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::AssumeOld => f.write_str("assume-old"),
            FailurePolicy::AssumeNew => f.write_str("assume-new"),
            FailurePolicy::Retry { attempts } => write!(f, "retry:{}", attempts),
            FailurePolicy::Abort => f.write_str("abort"),
        }
    }
}

/// One search: the field equals `old_value` at `low` and `new_value` at
/// `high`, and the transition lies in `(low, high]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefineTarget {
    pub netuid: RecordId,
    pub field: Field,
    pub old_value: FieldValue,
    pub new_value: FieldValue,
    pub low: Height,
    pub high: Height,
}

impl RefineTarget {
    /// Search window for a change found by the scanner.
    ///
    /// The scanner tags a change with the older height `h` of its sample
    /// pair and reports the newer sample's value first, so chronologically
    /// the field went from `new_value` (at `h`) to `old_value` (at the newer
    /// sample, normally `h + stride`). `scan_end` is the scan's most recent
    /// height; it locates the narrower pair that ends at a clamped 0.
    pub fn from_approx(change: &ApproxChange, stride: u64, scan_end: Option<Height>) -> Self {
        Self {
            netuid: change.netuid,
            field: change.field,
            old_value: change.new_value.clone(),
            new_value: change.old_value.clone(),
            low: change.height,
            high: pair_upper(change.height, stride, scan_end),
        }
    }

    fn holds_new(&self, snapshot: &Snapshot) -> bool {
        // A missing record reads as the old value.
        snapshot
            .get(&self.netuid)
            .is_some_and(|info| self.field.value(info) == self.new_value.as_deref())
    }

    fn holds_old(&self, snapshot: &Snapshot) -> bool {
        snapshot
            .get(&self.netuid)
            .map_or(true, |info| self.field.value(info) == self.old_value.as_deref())
    }
}

/// Settings for a refinement run.
#[derive(Debug, Clone)]
pub struct RefineParams {
    pub stride: u64,
    /// Most recent height of the scan that produced the changes, if known.
    pub scan_end: Option<Height>,
    pub policy: FailurePolicy,
    pub concurrency: ConcurrencyLimit,
    pub verify: bool,
}

/// What a refinement run produced. `changes` keeps input order.
#[derive(Debug, Default)]
pub struct RefineReport {
    pub changes: Vec<ExactChange>,
    /// Input changes whose refinement was aborted, with the reason.
    pub aborted: Vec<(ApproxChange, String)>,
}

/// Command-line overrides for `snaplog refine`.
#[derive(Debug, Clone, Default)]
pub struct RefineOverrides {
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub stride: Option<u64>,
    pub policy: Option<FailurePolicy>,
    pub concurrency: Option<ConcurrencyLimit>,
    pub verify: Option<bool>,
}

/// Whether the field holds the new value at `height`.
async fn probe(
    source: &dyn SnapshotSource,
    target: &RefineTarget,
    height: Height,
    policy: FailurePolicy,
) -> Result<bool> {
    let mut retries_left = match policy {
        FailurePolicy::Retry { attempts } => attempts,
        _ => 0,
    };

    loop {
        match fetch_snapshot(source, height).await {
            FetchOutcome::Fetched(snapshot) => return Ok(target.holds_new(&snapshot)),
            FetchOutcome::Failed if retries_left > 0 => {
                retries_left -= 1;
                debug!(height, retries_left, "retrying probe");
            }
            FetchOutcome::Failed => {
                return match policy {
                    FailurePolicy::AssumeOld | FailurePolicy::Retry { .. } => Ok(false),
                    FailurePolicy::AssumeNew => Ok(true),
                    FailurePolicy::Abort => bail!(
                        "snapshot at height {} unavailable while refining netuid {} {}",
                        height,
                        target.netuid,
                        target.field
                    ),
                };
            }
        }
    }
}

/// Binary-search `(target.low, target.high]` for the first height holding
/// the new value.
///
/// Always returns a height in `(low, high]`. The result only depends on the
/// backing state, so repeating a refinement yields the same height.
pub async fn refine(
    source: &dyn SnapshotSource,
    target: &RefineTarget,
    policy: FailurePolicy,
) -> Result<Height> {
    if target.low >= target.high {
        bail!(
            "empty refine window ({}, {}] for netuid {} {}",
            target.low,
            target.high,
            target.netuid,
            target.field
        );
    }

    // left: known to hold the new value; right: known to hold the old value.
    let (mut left, mut right) = (target.high, target.low);
    while left - right > 1 {
        let mid = right + (left - right) / 2;
        let is_new = probe(source, target, mid, policy).await?;
        debug!(netuid = target.netuid, field = %target.field, mid, is_new, "probe");
        if is_new {
            left = mid;
        } else {
            right = mid;
        }
    }

    Ok(left)
}

/// Read the field back at `height` and `height - 1`.
pub async fn verify(
    source: &dyn SnapshotSource,
    target: &RefineTarget,
    height: Height,
) -> Verification {
    let Some(before_height) = height.checked_sub(1) else {
        return Verification::Unavailable;
    };
    let at = fetch_snapshot(source, height).await;
    let before = fetch_snapshot(source, before_height).await;

    match (at.snapshot(), before.snapshot()) {
        (Some(at), Some(before)) => {
            if target.holds_new(at) && target.holds_old(before) {
                Verification::Confirmed
            } else {
                warn!(
                    netuid = target.netuid,
                    field = %target.field,
                    height,
                    "field is not monotonic in its window; refined height may not match this change"
                );
                Verification::Mismatch
            }
        }
        _ => Verification::Unavailable,
    }
}

async fn refine_one(
    source: &dyn SnapshotSource,
    change: &ApproxChange,
    params: &RefineParams,
) -> Result<ExactChange> {
    let target = RefineTarget::from_approx(change, params.stride, params.scan_end);
    let exact_height = refine(source, &target, params.policy).await?;
    let verification = if params.verify {
        verify(source, &target, exact_height).await
    } else {
        Verification::Skipped
    };

    Ok(ExactChange {
        netuid: target.netuid,
        field: target.field,
        old_value: target.old_value,
        new_value: target.new_value,
        exact_height,
        verification,
    })
}

/// Refine every change. Results come back in input order.
pub async fn refine_all(
    source: &dyn SnapshotSource,
    changes: &[ApproxChange],
    params: &RefineParams,
    progress: &dyn ProgressReporter,
) -> RefineReport {
    let total = changes.len() as u64;
    let mut done = 0u64;
    let mut results = BTreeMap::new();

    WorkerPool::new(params.concurrency)
        .run(
            changes.iter().enumerate(),
            |(i, change)| async move { (i, refine_one(source, change, params).await) },
            |(i, result)| {
                results.insert(i, result);
                done += 1;
                progress.report(ProgressEvent::Refining { n: done, total });
            },
        )
        .await;

    let mut report = RefineReport::default();
    for (i, result) in results {
        match result {
            Ok(exact) => report.changes.push(exact),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "refinement aborted");
                report.aborted.push((changes[i].clone(), format!("{:#}", e)));
            }
        }
    }
    report
}

/// Pick the stride for refining a table.
///
/// The manifest written by the scan is authoritative. An explicitly given
/// stride must agree with it; the configured stride is only used when no
/// manifest exists.
pub fn resolve_stride(
    manifest: Option<&ScanManifest>,
    explicit: Option<u64>,
    configured: u64,
) -> Result<u64> {
    let stride = match (manifest, explicit) {
        (Some(m), Some(s)) if m.stride != s => bail!(
            "stride mismatch: table was scanned with stride {} but {} was requested",
            m.stride,
            s
        ),
        (Some(m), _) => {
            if m.stride != configured && explicit.is_none() {
                info!(
                    manifest = m.stride,
                    configured, "using the stride recorded by the scan"
                );
            }
            m.stride
        }
        (None, Some(s)) => s,
        (None, None) => {
            warn!(
                stride = configured,
                "no scan manifest found; assuming the configured stride matches the scan"
            );
            configured
        }
    };
    if stride == 0 {
        bail!("stride must be > 0");
    }
    Ok(stride)
}

/// Load the approximate table, refine it against `source`, and write the
/// exact table. Completed refinements are written even when some abort.
pub async fn run_refine_with_source(
    config: &Config,
    source: &dyn SnapshotSource,
    overrides: &RefineOverrides,
    progress: &dyn ProgressReporter,
) -> Result<RefineReport> {
    let input = overrides
        .input
        .clone()
        .unwrap_or_else(|| config.output.approximate.clone());
    let output = overrides
        .output
        .clone()
        .unwrap_or_else(|| config.output.exact.clone());

    let manifest = table::read_manifest(&input)?;
    let stride = resolve_stride(manifest.as_ref(), overrides.stride, config.scan.stride)?;
    let changes = table::read_approximate(&input)?;

    source
        .current_height()
        .await
        .with_context(|| format!("Cannot reach state source at {}", source.describe()))?;

    let params = RefineParams {
        stride,
        scan_end: manifest.as_ref().map(|m| m.end),
        policy: overrides.policy.unwrap_or(config.refine.failure_policy),
        concurrency: overrides.concurrency.unwrap_or(config.refine.concurrency),
        verify: overrides.verify.unwrap_or(config.refine.verify),
    };
    info!(
        changes = changes.len(),
        stride,
        policy = %params.policy,
        concurrency = %params.concurrency,
        "refining"
    );

    let report = refine_all(source, &changes, &params, progress).await;
    table::write_exact(&output, &report.changes)?;

    let count = |v: Verification| {
        report
            .changes
            .iter()
            .filter(|c| c.verification == v)
            .count()
    };
    println!("refine {}", input.display());
    println!("  approximate changes: {}", changes.len());
    println!("  refined: {}", report.changes.len());
    if params.verify {
        println!("  verified: {}", count(Verification::Confirmed));
        println!("  mismatched: {}", count(Verification::Mismatch));
        println!("  unverifiable: {}", count(Verification::Unavailable));
    }
    println!("  written: {}", output.display());

    if !report.aborted.is_empty() {
        bail!(
            "{} of {} refinements aborted",
            report.aborted.len(),
            changes.len()
        );
    }
    println!("ok");

    Ok(report)
}

/// `snaplog refine` against the configured RPC endpoint.
pub async fn run_refine(
    config: &Config,
    overrides: &RefineOverrides,
    progress: &dyn ProgressReporter,
) -> Result<RefineReport> {
    let source = JsonRpcSource::new(&config.source)?;
    run_refine_with_source(config, &source, overrides, progress).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::source::MemorySource;
    use chrono::Utc;

    fn target(old: &str, new: &str, low: Height, high: Height) -> RefineTarget {
        RefineTarget {
            netuid: 1,
            field: Field::SubnetName,
            old_value: Some(old.into()),
            new_value: Some(new.into()),
            low,
            high,
        }
    }

    fn a_then_b_at_51() -> MemorySource {
        MemorySource::new(1000)
            .set_field(1, Field::SubnetName, 0, Some("A"))
            .set_field(1, Field::SubnetName, 51, Some("B"))
    }

    #[test]
    fn policy_parsing() {
        assert_eq!("assume-old".parse::<FailurePolicy>().unwrap(), FailurePolicy::AssumeOld);
        assert_eq!("assume-new".parse::<FailurePolicy>().unwrap(), FailurePolicy::AssumeNew);
        assert_eq!("abort".parse::<FailurePolicy>().unwrap(), FailurePolicy::Abort);
        assert_eq!(
            "retry:4".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::Retry { attempts: 4 }
        );
        assert!("retry:x".parse::<FailurePolicy>().is_err());
        assert!("ignore".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::Retry { attempts: 2 }.to_string(), "retry:2");
    }

    #[tokio::test]
    async fn finds_exact_transition() {
        let source = a_then_b_at_51();
        let h = refine(&source, &target("A", "B", 40, 60), FailurePolicy::AssumeOld)
            .await
            .unwrap();
        assert_eq!(h, 51);
    }

    #[tokio::test]
    async fn transition_at_window_edges() {
        let source = a_then_b_at_51();
        let at_top = refine(&source, &target("A", "B", 0, 51), FailurePolicy::AssumeOld)
            .await
            .unwrap();
        assert_eq!(at_top, 51);
        let at_bottom = refine(&source, &target("A", "B", 50, 150), FailurePolicy::AssumeOld)
            .await
            .unwrap();
        assert_eq!(at_bottom, 51);
    }

    #[tokio::test]
    async fn adjacent_window_needs_no_queries() {
        let source = a_then_b_at_51();
        let h = refine(&source, &target("A", "B", 50, 51), FailurePolicy::AssumeOld)
            .await
            .unwrap();
        assert_eq!(h, 51);
        assert_eq!(source.calls(), 0);
        assert!(refine(&source, &target("A", "B", 60, 60), FailurePolicy::AssumeOld)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn result_is_in_window_and_idempotent() {
        let source = a_then_b_at_51();
        for (low, high) in [(0, 100), (30, 70), (50, 52), (10, 1000)] {
            let t = target("A", "B", low, high);
            let first = refine(&source, &t, FailurePolicy::AssumeOld).await.unwrap();
            let second = refine(&source, &t, FailurePolicy::AssumeOld).await.unwrap();
            assert!(low < first && first <= high);
            assert_eq!(first, second);
        }
    }

    #[tokio::test]
    async fn failing_midpoint_biases_toward_old_value() {
        // The first probe of (40, 60] is 50, which is also the last "A" height.
        let source = a_then_b_at_51().fail_at(50).fail_at(55);
        let h = refine(&source, &target("A", "B", 40, 60), FailurePolicy::AssumeOld)
            .await
            .unwrap();
        // 50 → assumed old; 55 → assumed old; 57, 56 → B.
        assert_eq!(h, 56);
    }

    #[tokio::test]
    async fn assume_new_biases_downward() {
        let source = a_then_b_at_51().fail_at(45);
        let h = refine(&source, &target("A", "B", 40, 60), FailurePolicy::AssumeNew)
            .await
            .unwrap();
        // 50 → A; 55 → B; 52 → B; 51 → B.
        assert_eq!(h, 51);

        let source = a_then_b_at_51().fail_at(50);
        let h = refine(&source, &target("A", "B", 40, 60), FailurePolicy::AssumeNew)
            .await
            .unwrap();
        // 50 → assumed new; 45 → A; 47, 48, 49 → A.
        assert_eq!(h, 50);
    }

    #[tokio::test]
    async fn retry_and_abort_policies() {
        let source = a_then_b_at_51().fail_at(50);
        let h = refine(
            &source,
            &target("A", "B", 40, 60),
            FailurePolicy::Retry { attempts: 2 },
        )
        .await
        .unwrap();
        // 50 fails three times and is assumed old; 55, 52, 51 → B.
        assert_eq!(h, 51);
        assert_eq!(source.calls(), 6);

        let err = refine(&source, &target("A", "B", 40, 60), FailurePolicy::Abort)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("height 50"));
    }

    #[tokio::test]
    async fn missing_record_reads_as_old_value() {
        let source = MemorySource::new(100)
            .with_record(1, 30)
            .set_field(1, Field::SubnetName, 30, Some("A"))
            .set_field(1, Field::SubnetName, 70, Some("B"));
        let h = refine(&source, &target("A", "B", 0, 100), FailurePolicy::AssumeOld)
            .await
            .unwrap();
        assert_eq!(h, 70);
    }

    #[tokio::test]
    async fn verification_detects_non_monotonic_window() {
        let source = a_then_b_at_51();
        let t = target("A", "B", 40, 60);
        assert_eq!(verify(&source, &t, 51).await, Verification::Confirmed);
        assert_eq!(verify(&source, &t, 55).await, Verification::Mismatch);

        // A -> B at 51, back to A at 53, B again at 58.
        let flappy = a_then_b_at_51()
            .set_field(1, Field::SubnetName, 53, Some("A"))
            .set_field(1, Field::SubnetName, 58, Some("B"));
        let h = refine(&flappy, &t, FailurePolicy::AssumeOld).await.unwrap();
        assert!(40 < h && h <= 60);
        assert_eq!(verify(&flappy, &t, h).await, Verification::Confirmed);

        let failing = a_then_b_at_51().fail_at(50);
        assert_eq!(verify(&failing, &t, 51).await, Verification::Unavailable);
    }

    #[tokio::test]
    async fn refine_all_keeps_input_order_and_orientation() {
        let source = MemorySource::new(400)
            .set_field(1, Field::SubnetName, 0, Some("A"))
            .set_field(1, Field::SubnetName, 151, Some("B"))
            .set_field(2, Field::Discord, 0, Some("d1"))
            .set_field(2, Field::Discord, 277, Some("d2"));
        let changes = vec![
            ApproxChange {
                height: 200,
                netuid: 2,
                field: Field::Discord,
                old_value: Some("d2".into()),
                new_value: Some("d1".into()),
            },
            ApproxChange {
                height: 100,
                netuid: 1,
                field: Field::SubnetName,
                old_value: Some("B".into()),
                new_value: Some("A".into()),
            },
        ];
        let params = RefineParams {
            stride: 100,
            scan_end: None,
            policy: FailurePolicy::AssumeOld,
            concurrency: ConcurrencyLimit::new(2).unwrap(),
            verify: true,
        };
        let report = refine_all(&source, &changes, &params, &NoProgress).await;
        assert!(report.aborted.is_empty());
        assert_eq!(
            report.changes,
            vec![
                ExactChange {
                    netuid: 2,
                    field: Field::Discord,
                    old_value: Some("d1".into()),
                    new_value: Some("d2".into()),
                    exact_height: 277,
                    verification: Verification::Confirmed,
                },
                ExactChange {
                    netuid: 1,
                    field: Field::SubnetName,
                    old_value: Some("A".into()),
                    new_value: Some("B".into()),
                    exact_height: 151,
                    verification: Verification::Confirmed,
                },
            ]
        );
    }

    #[tokio::test]
    async fn refine_all_reports_aborted_changes() {
        let source = a_then_b_at_51().fail_at(100);
        let change = ApproxChange {
            height: 50,
            netuid: 1,
            field: Field::SubnetName,
            old_value: Some("B".into()),
            new_value: Some("A".into()),
        };
        let params = RefineParams {
            stride: 100,
            scan_end: None,
            policy: FailurePolicy::Abort,
            concurrency: ConcurrencyLimit::default(),
            verify: false,
        };
        let report = refine_all(&source, &[change], &params, &NoProgress).await;
        assert!(report.changes.is_empty());
        assert_eq!(report.aborted.len(), 1);
    }

    #[tokio::test]
    async fn clamped_pair_is_searched_within_its_own_width() {
        // Scan of 1050 at stride 100: the oldest pair is (0, 50].
        let source = MemorySource::new(1050)
            .set_field(1, Field::SubnetName, 0, Some("a"))
            .set_field(1, Field::SubnetName, 30, Some("b"))
            .set_field(1, Field::SubnetName, 80, Some("c"));
        let change = ApproxChange {
            height: 0,
            netuid: 1,
            field: Field::SubnetName,
            old_value: Some("b".into()),
            new_value: Some("a".into()),
        };

        let t = RefineTarget::from_approx(&change, 100, Some(1050));
        assert_eq!((t.low, t.high), (0, 50));
        assert_eq!(t.old_value.as_deref(), Some("a"));
        let h = refine(&source, &t, FailurePolicy::AssumeOld).await.unwrap();
        assert_eq!(h, 30);
        assert_eq!(verify(&source, &t, h).await, Verification::Confirmed);

        let older = ApproxChange { height: 50, ..change };
        let regular = RefineTarget::from_approx(&older, 100, Some(1050));
        assert_eq!((regular.low, regular.high), (50, 150));
    }

    #[test]
    fn stride_resolution() {
        let manifest = ScanManifest {
            stride: 50,
            start: 0,
            end: 500,
            sampled: 11,
            failed_heights: vec![],
            fields: Field::ALL.to_vec(),
            created_at: Utc::now(),
        };
        assert_eq!(resolve_stride(Some(&manifest), None, 100).unwrap(), 50);
        assert_eq!(resolve_stride(Some(&manifest), Some(50), 100).unwrap(), 50);
        assert!(resolve_stride(Some(&manifest), Some(100), 100).is_err());
        assert_eq!(resolve_stride(None, Some(25), 100).unwrap(), 25);
        assert_eq!(resolve_stride(None, None, 100).unwrap(), 100);
        assert!(resolve_stride(None, Some(0), 100).is_err());
    }
}
