//! Tabular change logs and the scan manifest.
//!
//! Both stages exchange plain CSV so the results can be inspected with any
//! spreadsheet tool:
//!
//! | File | Columns |
//! |------|---------|
//! | approximate | `block_number,netuid,parameter,old_value,new_value` |
//! | exact | `netuid,parameter,old_value,new_value,exact_block,verified` |
//!
//! Null values are written as empty cells and read back as null.
//!
//! Next to the approximate table the scan writes `<name>.meta.json`, which
//! records the stride and window the table was produced with. The refine
//! stage reads it to build correctly sized search windows.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ApproxChange, ExactChange, Field, Height, RecordId, Verification};
use crate::scan::{ScanParams, ScanReport};

#[derive(Debug, Serialize, Deserialize)]
struct ApproxRow {
    block_number: Height,
    netuid: RecordId,
    parameter: Field,
    old_value: Option<String>,
    new_value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExactRow {
    netuid: RecordId,
    parameter: Field,
    old_value: Option<String>,
    new_value: Option<String>,
    exact_block: Height,
    #[serde(default)]
    verified: String,
}

/// Parameters and outcome of the scan that produced an approximate table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanManifest {
    pub stride: u64,
    pub start: Height,
    pub end: Height,
    pub sampled: usize,
    pub failed_heights: Vec<Height>,
    pub fields: Vec<Field>,
    pub created_at: DateTime<Utc>,
}

impl ScanManifest {
    pub fn new(params: &ScanParams, report: &ScanReport) -> Self {
        Self {
            stride: params.stride,
            start: params.start,
            end: params.end,
            sampled: report.sampled.len(),
            failed_heights: report.failed_heights.clone(),
            fields: params.fields.clone(),
            created_at: Utc::now(),
        }
    }
}

/// `changes.csv` → `changes.meta.json`.
pub fn manifest_path(table: &Path) -> PathBuf {
    table.with_extension("meta.json")
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

fn open_writer(path: &Path) -> Result<csv::Writer<File>> {
    create_parent(path)?;
    csv::Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn open_reader(path: &Path) -> Result<csv::Reader<File>> {
    csv::Reader::from_path(path).with_context(|| format!("Failed to open {}", path.display()))
}

pub fn write_approximate(path: &Path, changes: &[ApproxChange]) -> Result<()> {
    let mut writer = open_writer(path)?;
    if changes.is_empty() {
        writer.write_record(["block_number", "netuid", "parameter", "old_value", "new_value"])?;
    }
    for change in changes {
        writer.serialize(ApproxRow {
            block_number: change.height,
            netuid: change.netuid,
            parameter: change.field,
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
        })?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Load an approximate table. Any malformed row fails the whole load.
pub fn read_approximate(path: &Path) -> Result<Vec<ApproxChange>> {
    let mut reader = open_reader(path)?;
    let mut changes = Vec::new();
    for (i, row) in reader.deserialize::<ApproxRow>().enumerate() {
        // Row 1 is the header.
        let row = row.with_context(|| format!("{}: malformed row {}", path.display(), i + 2))?;
        changes.push(ApproxChange {
            height: row.block_number,
            netuid: row.netuid,
            field: row.parameter,
            old_value: row.old_value,
            new_value: row.new_value,
        });
    }
    Ok(changes)
}

pub fn write_exact(path: &Path, changes: &[ExactChange]) -> Result<()> {
    let mut writer = open_writer(path)?;
    if changes.is_empty() {
        writer.write_record([
            "netuid",
            "parameter",
            "old_value",
            "new_value",
            "exact_block",
            "verified",
        ])?;
    }
    for change in changes {
        writer.serialize(ExactRow {
            netuid: change.netuid,
            parameter: change.field,
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            exact_block: change.exact_height,
            verified: change.verification.as_str().to_string(),
        })?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn read_exact(path: &Path) -> Result<Vec<ExactChange>> {
    let mut reader = open_reader(path)?;
    let mut changes = Vec::new();
    for (i, row) in reader.deserialize::<ExactRow>().enumerate() {
        let row = row.with_context(|| format!("{}: malformed row {}", path.display(), i + 2))?;
        let verification = match row.verified.as_str() {
            "yes" => Verification::Confirmed,
            "no" => Verification::Mismatch,
            "unknown" => Verification::Unavailable,
            "" => Verification::Skipped,
            other => bail!(
                "{}: row {}: invalid verified value '{}'",
                path.display(),
                i + 2,
                other
            ),
        };
        changes.push(ExactChange {
            netuid: row.netuid,
            field: row.parameter,
            old_value: row.old_value,
            new_value: row.new_value,
            exact_height: row.exact_block,
            verification,
        });
    }
    Ok(changes)
}

pub fn write_manifest(table: &Path, manifest: &ScanManifest) -> Result<()> {
    let path = manifest_path(table);
    create_parent(&path)?;
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Load the manifest next to `table`, if there is one.
pub fn read_manifest(table: &Path) -> Result<Option<ScanManifest>> {
    let path = manifest_path(table);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn approx(height: Height, old: Option<&str>, new: Option<&str>) -> ApproxChange {
        ApproxChange {
            height,
            netuid: 9,
            field: Field::SubnetUrl,
            old_value: old.map(str::to_string),
            new_value: new.map(str::to_string),
        }
    }

    #[test]
    fn approximate_table_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out/changes.csv");
        write_approximate(
            &path,
            &[approx(500, Some("https://a, b"), None), approx(400, None, Some("x"))],
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "block_number,netuid,parameter,old_value,new_value");
        assert_eq!(lines[1], "500,9,subnet_url,\"https://a, b\",");
        assert_eq!(lines[2], "400,9,subnet_url,,x");

        let back = read_approximate(&path).unwrap();
        assert_eq!(back[0].old_value.as_deref(), Some("https://a, b"));
        assert_eq!(back[0].new_value, None);
        assert_eq!(back[1].height, 400);
    }

    #[test]
    fn empty_tables_still_have_headers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("empty.csv");
        write_approximate(&path, &[]).unwrap();
        assert!(read_approximate(&path).unwrap().is_empty());

        let exact = tmp.path().join("exact.csv");
        write_exact(&exact, &[]).unwrap();
        let text = std::fs::read_to_string(&exact).unwrap();
        assert_eq!(
            text.trim(),
            "netuid,parameter,old_value,new_value,exact_block,verified"
        );
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.csv");

        std::fs::write(
            &path,
            "block_number,netuid,parameter,old_value,new_value\n100,1,subnet_name,a,b\nxx,1,subnet_name,a,b\n",
        )
        .unwrap();
        let err = read_approximate(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("row 3"));

        std::fs::write(
            &path,
            "block_number,netuid,parameter,old_value,new_value\n100,1,tempo,a,b\n",
        )
        .unwrap();
        assert!(read_approximate(&path).is_err());

        assert!(read_approximate(&tmp.path().join("missing.csv")).is_err());
    }

    #[test]
    fn exact_table_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("exact.csv");
        let change = ExactChange {
            netuid: 4,
            field: Field::OwnerColdkey,
            old_value: Some("5Old".into()),
            new_value: Some("5New".into()),
            exact_height: 1234,
            verification: Verification::Confirmed,
        };
        write_exact(&path, std::slice::from_ref(&change)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("4,owner_coldkey,5Old,5New,1234,yes"));
        assert_eq!(read_exact(&path).unwrap(), vec![change]);
    }

    #[test]
    fn manifest_lives_next_to_table() {
        let tmp = TempDir::new().unwrap();
        let table = tmp.path().join("changes.csv");
        assert_eq!(manifest_path(&table), tmp.path().join("changes.meta.json"));
        assert!(read_manifest(&table).unwrap().is_none());

        let manifest = ScanManifest {
            stride: 100,
            start: 0,
            end: 1000,
            sampled: 11,
            failed_heights: vec![300],
            fields: vec![Field::SubnetName],
            created_at: Utc::now(),
        };
        write_manifest(&table, &manifest).unwrap();
        assert_eq!(read_manifest(&table).unwrap(), Some(manifest));
    }
}
