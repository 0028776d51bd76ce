//! Core data models used throughout snaplog.
//!
//! These types represent the subnet records returned by the chain, the
//! snapshots built from them, and the approximate and exact change records
//! that flow from the scanner to the refiner.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Block number on the source chain. Larger is more recent.
pub type Height = u64;

/// Subnet identifier (`netuid`), unique within one snapshot.
pub type RecordId = u16;

/// A field value as observed at one height. `None` is null/absent.
pub type FieldValue = Option<String>;

/// Optional identity block attached to a subnet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetIdentity {
    #[serde(default)]
    pub github_repo: Option<String>,
    #[serde(default)]
    pub subnet_contact: Option<String>,
    #[serde(default)]
    pub subnet_url: Option<String>,
    #[serde(default)]
    pub discord: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One subnet record as returned by the snapshot query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub netuid: RecordId,
    #[serde(default)]
    pub owner_hotkey: Option<String>,
    #[serde(default)]
    pub owner_coldkey: Option<String>,
    #[serde(default)]
    pub subnet_name: Option<String>,
    #[serde(default)]
    pub subnet_identity: Option<SubnetIdentity>,
}

impl SubnetInfo {
    pub fn new(netuid: RecordId) -> Self {
        Self {
            netuid,
            ..Self::default()
        }
    }

    fn identity_mut(&mut self) -> &mut SubnetIdentity {
        self.subnet_identity.get_or_insert_with(Default::default)
    }

    /// Overwrite a single tracked field, creating the identity block if needed.
    pub fn set(&mut self, field: Field, value: FieldValue) {
        match field {
            Field::OwnerHotkey => self.owner_hotkey = value,
            Field::OwnerColdkey => self.owner_coldkey = value,
            Field::SubnetName => self.subnet_name = value,
            Field::GithubRepo => self.identity_mut().github_repo = value,
            Field::SubnetContact => self.identity_mut().subnet_contact = value,
            Field::SubnetUrl => self.identity_mut().subnet_url = value,
            Field::Discord => self.identity_mut().discord = value,
            Field::Description => self.identity_mut().description = value,
        }
    }
}

/// The full set of subnets at one height, keyed by `netuid`.
pub type Snapshot = BTreeMap<RecordId, SubnetInfo>;

/// Build a [`Snapshot`] from a list of records. Later duplicates win.
pub fn snapshot_from_records(records: impl IntoIterator<Item = SubnetInfo>) -> Snapshot {
    records.into_iter().map(|r| (r.netuid, r)).collect()
}

/// A tracked field of [`SubnetInfo`].
///
/// The first three live on the record itself; the rest live on the
/// optional [`SubnetIdentity`] and read as null when it is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    OwnerHotkey,
    OwnerColdkey,
    SubnetName,
    GithubRepo,
    SubnetContact,
    SubnetUrl,
    Discord,
    Description,
}

impl Field {
    /// Every tracked field, in comparison order.
    pub const ALL: [Field; 8] = [
        Field::OwnerHotkey,
        Field::OwnerColdkey,
        Field::SubnetName,
        Field::GithubRepo,
        Field::SubnetContact,
        Field::SubnetUrl,
        Field::Discord,
        Field::Description,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::OwnerHotkey => "owner_hotkey",
            Field::OwnerColdkey => "owner_coldkey",
            Field::SubnetName => "subnet_name",
            Field::GithubRepo => "github_repo",
            Field::SubnetContact => "subnet_contact",
            Field::SubnetUrl => "subnet_url",
            Field::Discord => "discord",
            Field::Description => "description",
        }
    }

    pub fn is_identity(&self) -> bool {
        !matches!(
            self,
            Field::OwnerHotkey | Field::OwnerColdkey | Field::SubnetName
        )
    }

    /// Extract this field's value from a record.
    pub fn value<'a>(&self, info: &'a SubnetInfo) -> Option<&'a str> {
        let identity = info.subnet_identity.as_ref();
        let value = match self {
            Field::OwnerHotkey => info.owner_hotkey.as_ref(),
            Field::OwnerColdkey => info.owner_coldkey.as_ref(),
            Field::SubnetName => info.subnet_name.as_ref(),
            Field::GithubRepo => identity.and_then(|i| i.github_repo.as_ref()),
            Field::SubnetContact => identity.and_then(|i| i.subnet_contact.as_ref()),
            Field::SubnetUrl => identity.and_then(|i| i.subnet_url.as_ref()),
            Field::Discord => identity.and_then(|i| i.discord.as_ref()),
            Field::Description => identity.and_then(|i| i.description.as_ref()),
        };
        value.map(String::as_str)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Field::ALL.iter().map(Field::as_str).collect();
                anyhow::anyhow!("Unknown field '{}'. Must be one of: {}", s, known.join(", "))
            })
    }
}

/// A field difference between two adjacent sampled snapshots.
///
/// `height` is the older height of the compared pair. `old_value` is the
/// value in the newer snapshot and `new_value` the value in the older one,
/// in the order the scanner walks the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproxChange {
    pub height: Height,
    pub netuid: RecordId,
    pub field: Field,
    pub old_value: FieldValue,
    pub new_value: FieldValue,
}

/// Outcome of the optional read-back after a refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Field equals the new value at the height and the old value just below.
    Confirmed,
    /// At least one of the two reads disagreed; the window is not monotonic.
    Mismatch,
    /// A verification read failed.
    Unavailable,
    /// Verification was disabled.
    Skipped,
}

impl Verification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verification::Confirmed => "yes",
            Verification::Mismatch => "no",
            Verification::Unavailable => "unknown",
            Verification::Skipped => "",
        }
    }
}

/// A change narrowed to the exact height at which it took effect.
///
/// `old_value` held immediately before `exact_height`; `new_value` holds
/// from `exact_height` on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactChange {
    pub netuid: RecordId,
    pub field: Field,
    pub old_value: FieldValue,
    pub new_value: FieldValue,
    pub exact_height: Height,
    pub verification: Verification,
}
